use relay_bus::BusError;
use thiserror::Error;

use crate::identifier::IdentifierError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error("broker already shut down")]
    ShutDown,
}
