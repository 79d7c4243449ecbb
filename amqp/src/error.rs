//! Translation of lapin errors into [`BrokerError`].
//!
//! Socket failures and closed channels or connections become the transient
//! variants; protocol errors the broker reports with a reply code are
//! permanent unless the code says the broker is shutting down.

use courier_core::broker::BrokerError;

const CONNECTION_FORCED: u16 = 320;
const ACCESS_REFUSED: u16 = 403;
const NOT_ALLOWED: u16 = 530;

/// Whether the error means the connection or channel is gone.
fn is_disconnect(error: &lapin::Error) -> bool {
    match error {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::MissingHeartbeatError => true,
        lapin::Error::ProtocolError(e) => e.get_id() == CONNECTION_FORCED,
        _ => false,
    }
}

pub(crate) fn connect(error: lapin::Error) -> BrokerError {
    if is_disconnect(&error) {
        return BrokerError::ConnectionFailed(error.to_string());
    }
    match &error {
        lapin::Error::ProtocolError(e) if matches!(e.get_id(), ACCESS_REFUSED | NOT_ALLOWED) => {
            BrokerError::AccessRefused(e.to_string())
        },
        _ => BrokerError::Other(error.to_string()),
    }
}

pub(crate) fn channel(error: lapin::Error) -> BrokerError {
    if is_disconnect(&error) {
        BrokerError::ChannelClosed(error.to_string())
    } else {
        BrokerError::Other(error.to_string())
    }
}

pub(crate) fn declare(queue: &str, error: lapin::Error) -> BrokerError {
    if is_disconnect(&error) {
        return BrokerError::ChannelClosed(error.to_string());
    }
    BrokerError::DeclareFailed {
        queue: queue.to_string(),
        reason: error.to_string(),
    }
}

pub(crate) fn publish(queue: &str, error: lapin::Error) -> BrokerError {
    if is_disconnect(&error) {
        return BrokerError::ChannelClosed(error.to_string());
    }
    BrokerError::PublishFailed {
        queue: queue.to_string(),
        reason: error.to_string(),
    }
}

pub(crate) fn consume(queue: &str, error: lapin::Error) -> BrokerError {
    if is_disconnect(&error) {
        return BrokerError::ChannelClosed(error.to_string());
    }
    BrokerError::ConsumeFailed {
        queue: queue.to_string(),
        reason: error.to_string(),
    }
}

pub(crate) fn ack(delivery_tag: u64, error: lapin::Error) -> BrokerError {
    BrokerError::AckFailed {
        delivery_tag,
        reason: error.to_string(),
    }
}
