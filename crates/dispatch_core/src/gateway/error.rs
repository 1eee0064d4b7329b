use std::io;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::geo::GeoError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed")]
    Unauthenticated,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error("failed to publish location: {0}")]
    Channel(#[from] ChannelError),

    #[error("failed to bind gateway listener at {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("session i/o failed: {0}")]
    Io(#[from] io::Error),
}
