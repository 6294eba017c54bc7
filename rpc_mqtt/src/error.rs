// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types surfaced by the transport contracts in [`crate::interface`].

use thiserror::Error;

/// Error returned by a publish/subscribe/unsubscribe call, or by waiting on its completion.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The underlying client has been disconnected and the call cannot be serviced.
    #[error("client is disconnected")]
    Disconnected,
    /// The underlying client rejected the request outright.
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::v5::ClientError),
    /// The topic or topic filter supplied was not well-formed.
    #[error("invalid topic filter '{0}'")]
    InvalidTopicFilter(String),
}

/// Error returned while waiting for a [`crate::interface::CompletionToken`] to resolve.
#[derive(Error, Debug, Clone)]
pub enum CompletionError {
    /// The broker returned a reason code indicating the operation did not succeed.
    #[error("operation failed with reason code {reason_code}")]
    Failed {
        /// Broker-reported reason code for the failure.
        reason_code: u8,
    },
    /// The connection was lost before the operation could complete.
    #[error("connection lost before completion")]
    Disconnected,
}

/// Error acknowledging a received publish.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AckError {
    /// This publish has already been acknowledged (or is already pending acknowledgement).
    #[error("publish already acked")]
    AlreadyAcked,
    /// The underlying client could not be reached to perform the ack.
    #[error("mqtt client disconnected")]
    Disconnected,
}
