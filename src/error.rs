//! Error kinds surfaced by the core.
//!
//! Replaces the manual `Display` impl the teacher's own
//! `xhci/utils.rs::XHCIError` used before it adopted `thiserror`.

use crate::trb::CompletionStatusCode;

/// Every failure mode the core can report, one variant per named kind.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum XhciError {
    #[error("controller reset did not complete (phase: {phase})")]
    ControllerReset { phase: &'static str },

    #[error("BIOS did not relinquish ownership before timeout")]
    BiosHandoffTimeout,

    #[error("port {port} did not report PED after reset")]
    PortReset { port: u8 },

    #[error("no command completion event for TRB type {trb_type:#x} within bound")]
    CommandTimeout { trb_type: u8 },

    #[error("no transfer event within bound")]
    TransferTimeout,

    #[error("command completed with non-success code {completion_code:?}")]
    CommandFailed {
        completion_code: CompletionStatusCode,
    },

    #[error("transfer completed with non-success code {completion_code:?}")]
    TransferFailed {
        completion_code: CompletionStatusCode,
    },

    #[error("configuration descriptor exceeds the statically provisioned buffer")]
    DescriptorTooLarge,

    #[error("DMA allocator failed to satisfy a request")]
    OutOfResources,
}

pub type Result<T> = core::result::Result<T, XhciError>;

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::string::ToString;

    #[test]
    fn messages_interpolate_their_fields() {
        let err = XhciError::ControllerReset { phase: "reset" };
        assert_eq!(err.to_string(), "controller reset did not complete (phase: reset)");

        let err = XhciError::CommandTimeout { trb_type: 0x9 };
        assert_eq!(err.to_string(), "no command completion event for TRB type 0x9 within bound");

        let err = XhciError::CommandFailed {
            completion_code: CompletionStatusCode::StallError,
        };
        assert_eq!(err.to_string(), "command completed with non-success code StallError");
    }
}
