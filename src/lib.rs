use std::time::Duration;

use log::*;

pub mod endpoint;
pub mod query;
pub mod socks;
#[cfg(test)]
mod testing;
pub mod transport;
mod util;

pub use crate::endpoint::{Endpoint, EndpointError};
pub use crate::query::{Answer, QueryError};
pub use crate::transport::{Channel, ConnectionError, OpenChannels};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Where and how a query is sent. Every call to [`Lookup::query`] opens a
/// fresh channel and closes it before returning.
#[derive(Debug, Clone)]
pub struct Lookup {
    server: Endpoint,
    proxy: Option<Endpoint>,
    timeout: Duration,
    open_channels: OpenChannels,
}

impl Lookup {
    pub fn default(server: Endpoint, proxy: Option<Endpoint>) -> Self {
        Self::new(server, proxy, DEFAULT_TIMEOUT)
    }

    pub fn new(server: Endpoint, proxy: Option<Endpoint>, timeout: Duration) -> Self {
        Lookup {
            server,
            proxy,
            timeout,
            open_channels: OpenChannels::default(),
        }
    }

    pub fn server(&self) -> &Endpoint {
        &self.server
    }

    pub fn proxy(&self) -> Option<&Endpoint> {
        self.proxy.as_ref()
    }

    /// Channels opened by this lookup that have not been closed yet.
    pub fn open_channels(&self) -> usize {
        self.open_channels.count()
    }

    /// Asks the server for the A record of `domain` and returns the first
    /// answer.
    pub async fn query(&self, domain: &str) -> Result<Answer, Error> {
        let mut channel = transport::open(
            &self.server,
            self.proxy.as_ref(),
            self.timeout,
            &self.open_channels,
        )
        .await?;
        let answer = query::exchange(domain, channel.as_mut()).await;
        drop(channel);

        match &answer {
            Ok(answer) => info!("{domain} via {} => {answer}", self.server),
            Err(e) => warn!("{domain} via {} failed: {e}", self.server),
        }
        Ok(answer?)
    }
}
