#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Link is not connected")]
    NotConnected,

    #[error("Link is already connected")]
    AlreadyConnected,

    #[error("A connect or disconnect is already in progress")]
    ConnectionInProgress,

    #[error("Payload of {0} bytes exceeds the maximum frame payload")]
    PayloadTooLarge(usize),

    #[error("Connection request timed out")]
    ConnectionTimeout,

    #[error("Link dropped while the operation was pending")]
    Disconnected,

    #[error("No transmit hook has been installed")]
    TxHookMissing,

    #[error("A transmit hook has already been installed")]
    TxHookInstalled,
}
