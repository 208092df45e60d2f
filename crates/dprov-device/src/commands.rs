//! # Secure-Element Command Set
//!
//! The vendor-defined read sequence on top of [`CommandChannel`]: the chip
//! serial number from `print-chip-info` and the factory device certificate
//! from `get-device-cert`.

use dprov_core::SerialNumber;

use crate::channel::{CommandChannel, Response};
use crate::error::ChannelError;

/// Reports chip model and serial number.
pub const PRINT_CHIP_INFO: &str = "print-chip-info";

/// Prints the factory device certificate as PEM.
pub const GET_DEVICE_CERT: &str = "get-device-cert";

const SERIAL_FIELD: &str = "Serial Number:";
const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Identity read from a secure element. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Secure-element serial number.
    pub serial: SerialNumber,
    /// Factory device certificate, PEM.
    pub certificate_pem: String,
}

/// Read the serial number and device certificate. The channel must be READY.
pub fn read_identity(channel: &mut CommandChannel) -> Result<DeviceIdentity, ChannelError> {
    let serial = read_serial_number(channel)?;
    let certificate_pem = read_device_certificate(channel)?;
    tracing::info!(serial = %serial, "device identity read");
    Ok(DeviceIdentity {
        serial,
        certificate_pem,
    })
}

/// Run `print-chip-info` and extract the serial number.
pub fn read_serial_number(channel: &mut CommandChannel) -> Result<SerialNumber, ChannelError> {
    parse_serial_number(&channel.execute(PRINT_CHIP_INFO)?)
}

/// Run `get-device-cert` and extract the PEM certificate.
pub fn read_device_certificate(channel: &mut CommandChannel) -> Result<String, ChannelError> {
    parse_device_certificate(&channel.execute(GET_DEVICE_CERT)?)
}

/// Extract `Serial Number: <hex bytes>` from a chip-info response.
pub fn parse_serial_number(response: &Response) -> Result<SerialNumber, ChannelError> {
    let raw = response
        .field(SERIAL_FIELD)
        .ok_or_else(|| protocol(response, "no serial number line"))?;
    SerialNumber::parse(raw).map_err(|e| protocol(response, &e.to_string()))
}

/// Extract the first PEM certificate block from a response, normalised to
/// `\n` line endings with a trailing newline.
pub fn parse_device_certificate(response: &Response) -> Result<String, ChannelError> {
    let mut lines = response.lines.iter().map(|l| l.trim());
    if !lines.by_ref().any(|l| l == PEM_BEGIN) {
        return Err(protocol(response, "no PEM certificate in response"));
    }
    let mut pem = String::from(PEM_BEGIN);
    pem.push('\n');
    for line in lines {
        pem.push_str(line);
        pem.push('\n');
        if line == PEM_END {
            return Ok(pem);
        }
    }
    Err(protocol(response, "unterminated PEM certificate"))
}

fn protocol(response: &Response, reason: &str) -> ChannelError {
    ChannelError::Protocol {
        command: response.command.clone(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn response(command: &str, lines: &[&str]) -> Response {
        Response {
            command: command.to_string(),
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn serial_number_from_spaced_bytes() {
        let r = response(
            PRINT_CHIP_INFO,
            &["Chip Model: ATECC608", "Serial Number: 01 23 45 67 89 ab cd ef"],
        );
        assert_eq!(parse_serial_number(&r).unwrap().as_str(), "0123456789ABCDEF");
    }

    #[test]
    fn missing_or_bad_serial_is_protocol_error() {
        let r = response(PRINT_CHIP_INFO, &["Chip Model: ATECC608"]);
        assert!(matches!(parse_serial_number(&r), Err(ChannelError::Protocol { .. })));
        let r = response(PRINT_CHIP_INFO, &["Serial Number: zz"]);
        assert!(matches!(parse_serial_number(&r), Err(ChannelError::Protocol { .. })));
    }

    #[test]
    fn certificate_extracted_between_markers() {
        let r = response(
            GET_DEVICE_CERT,
            &["noise", PEM_BEGIN, "MIIBAAAA\r", "BBBB", PEM_END, "trailer"],
        );
        assert_eq!(
            parse_device_certificate(&r).unwrap(),
            format!("{PEM_BEGIN}\nMIIBAAAA\nBBBB\n{PEM_END}\n")
        );
    }

    #[test]
    fn truncated_certificate_rejected() {
        let r = response(GET_DEVICE_CERT, &[PEM_BEGIN, "MIIB"]);
        assert!(parse_device_certificate(&r).is_err());
        let r = response(GET_DEVICE_CERT, &["nothing here"]);
        assert!(parse_device_certificate(&r).is_err());
    }

    proptest! {
        #[test]
        fn any_serial_bytes_survive_the_chip_info_line(bytes in proptest::collection::vec(any::<u8>(), 1..=16)) {
            let spaced: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
            let line = format!("Serial Number: {}", spaced.join(" "));
            let r = response(PRINT_CHIP_INFO, &[line.as_str()]);
            let serial = parse_serial_number(&r).unwrap();
            prop_assert_eq!(serial.as_str(), hex_upper(&bytes));
        }
    }

    fn hex_upper(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02X}")).collect()
    }
}
