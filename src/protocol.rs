//! Text wire protocol spoken with the rig.
//!
//! The control channel carries `#`-terminated packets of four space-separated numbers
//! in both directions, plus the bare keywords `new_target` and `target` and free-form
//! `executing` notices from the server. The data channel answers each poll with
//! `"<accuracy> <difference> <target_weight> <elapsed_time>"`, or `"9 9 9"` when there
//! is nothing to report.
//!
//! Everything here is pure: no I/O and no state.

use serde::{Deserialize, Serialize};

use crate::{DoserError, Result};

/// Terminator closing every control packet.
pub const PACKET_TERMINATOR: char = '#';

/// Server request for the next target row.
pub const NEW_TARGET: &str = "new_target";

/// Server acknowledgement of a target.
pub const TARGET_ACK: &str = "target";

/// Marker contained in server progress notices.
pub const EXECUTING: &str = "executing";

/// Data-channel response meaning "no sample this poll".
pub const NO_SAMPLE_SENTINEL: &str = "9 9 9";

/// Default data-channel poll token.
pub const DEFAULT_REQUEST_TOKEN: &str = "request_weight";

/// `target_weight` value of a continuation command: keep shaking toward the current target.
pub const CONTINUE_TARGET_WEIGHT: f64 = 0.0;

/// Number of numeric fields in a control packet.
const PACKET_FIELDS: usize = 4;

/// A decoded control-channel record.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// The server is ready for the next target row.
    NewTarget,
    /// The server acknowledged the last target.
    TargetAck,
    /// Progress notice; the raw text is preserved.
    Executing(String),
    /// A four-field packet echoed by the server.
    Data(ControlCommand),
    /// Well-formed text that is not part of the protocol.
    Unknown(String),
    /// A packet whose fields could not be parsed.
    Malformed(String),
}

/// The quantities serialized into an outgoing control packet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub target_weight: f64,
    pub shaking_amplitude: f64,
    pub current_weight: f64,
    pub shaking_angle: f64,
}

impl ControlCommand {
    /// Command for a freshly loaded target.
    pub fn new(
        target_weight: f64,
        shaking_amplitude: f64,
        current_weight: f64,
        shaking_angle: f64,
    ) -> Self {
        Self { target_weight, shaking_amplitude, current_weight, shaking_angle }
    }

    /// Continuation command, sent in answer to `executing`.
    pub fn continuation(shaking_amplitude: f64, current_weight: f64, shaking_angle: f64) -> Self {
        Self::new(CONTINUE_TARGET_WEIGHT, shaking_amplitude, current_weight, shaking_angle)
    }

    /// Whether this command carries the "no new target" sentinel.
    pub fn is_continuation(&self) -> bool {
        self.target_weight == CONTINUE_TARGET_WEIGHT
    }

    /// Render this command as a control packet.
    pub fn to_packet(&self) -> Option<String> {
        format_control_packet(
            self.target_weight,
            self.shaking_amplitude,
            self.current_weight,
            self.shaking_angle,
        )
    }
}

/// One measurement reported on the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub accuracy: f64,
    pub difference: f64,
    pub target_weight: f64,
    #[serde(rename = "time")]
    pub elapsed_time: f64,
}

/// Render `"{target} {amplitude} {current} {angle} #"`.
///
/// Returns `None` if the rendered packet does not pass [`validate_packet`], which
/// happens for non-finite inputs.
pub fn format_control_packet(
    target_weight: f64,
    amplitude: f64,
    current_weight: f64,
    angle: f64,
) -> Option<String> {
    let packet =
        format!("{target_weight} {amplitude} {current_weight} {angle} {PACKET_TERMINATOR}");

    if validate_packet(&packet) {
        Some(packet)
    } else {
        tracing::warn!(packet = %packet, "Formatted control packet failed validation");
        None
    }
}

/// Check that `text` is four finite numbers followed by `#`.
pub fn validate_packet(text: &str) -> bool {
    let Some(body) = text.strip_suffix(PACKET_TERMINATOR) else {
        return false;
    };

    let tokens: Vec<&str> = body.split_whitespace().collect();
    tokens.len() == PACKET_FIELDS && tokens.iter().all(|token| parse_number(token).is_ok())
}

/// Decode one control-channel record.
pub fn parse_response(text: &str) -> Message {
    let response = text.trim();

    if response.is_empty() {
        return Message::Malformed("empty response".to_string());
    }
    if response == NEW_TARGET {
        return Message::NewTarget;
    }
    if response == TARGET_ACK {
        return Message::TargetAck;
    }
    if response.contains(EXECUTING) {
        return Message::Executing(response.to_string());
    }

    let Some(body) = response.strip_suffix(PACKET_TERMINATOR) else {
        return Message::Unknown(response.to_string());
    };

    let tokens: Vec<&str> = body.split_whitespace().collect();
    if tokens.len() != PACKET_FIELDS {
        return Message::Unknown(response.to_string());
    }

    match parse_fields::<PACKET_FIELDS>(&tokens) {
        Ok([target_weight, shaking_amplitude, current_weight, shaking_angle]) => {
            Message::Data(ControlCommand {
                target_weight,
                shaking_amplitude,
                current_weight,
                shaking_angle,
            })
        }
        Err(e) => Message::Malformed(e.to_string()),
    }
}

/// Decode a data-channel response.
///
/// `Ok(None)` is the "no sample" sentinel. Fewer than four fields, or a field that is
/// not a number, is a protocol error. Fields past the fourth are ignored.
pub fn parse_telemetry(text: &str) -> Result<Option<TelemetrySample>> {
    let response = text.trim();

    if response == NO_SAMPLE_SENTINEL {
        return Ok(None);
    }

    let tokens: Vec<&str> = response.split_whitespace().collect();
    if tokens.len() < PACKET_FIELDS {
        return Err(DoserError::protocol(
            "telemetry response",
            format!("expected at least {PACKET_FIELDS} fields, got {}: {response:?}", tokens.len()),
        ));
    }

    let [accuracy, difference, target_weight, elapsed_time] =
        parse_fields::<PACKET_FIELDS>(&tokens[..PACKET_FIELDS])?;

    Ok(Some(TelemetrySample { accuracy, difference, target_weight, elapsed_time }))
}

fn parse_fields<const N: usize>(tokens: &[&str]) -> Result<[f64; N]> {
    let mut fields = [0.0; N];
    for (field, token) in fields.iter_mut().zip(tokens) {
        *field = parse_number(token)?;
    }
    Ok(fields)
}

fn parse_number(token: &str) -> Result<f64> {
    match token.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        Ok(_) => Err(DoserError::protocol("numeric field", format!("non-finite value {token:?}"))),
        Err(e) => Err(DoserError::protocol("numeric field", format!("{token:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn formatted_packets_validate_and_parse_back(
            target in -1.0e6f64..1.0e6,
            amplitude in 0.0f64..100.0,
            current in -1.0e6f64..1.0e6,
            angle in 0.0f64..30.0
          ) {
            let packet = format_control_packet(target, amplitude, current, angle);
            prop_assert!(packet.is_some());
            let packet = packet.unwrap();

            prop_assert!(validate_packet(&packet));
            prop_assert_eq!(
              parse_response(&packet),
              Message::Data(ControlCommand::new(target, amplitude, current, angle))
            );
          }

          #[test]
          fn arbitrary_text_never_panics(text in ".*") {
            let _ = parse_response(&text);
            let _ = parse_telemetry(&text);
            let _ = validate_packet(&text);
          }
        }
    }

    #[test]
    fn keywords_are_recognised() {
        assert_eq!(parse_response("new_target"), Message::NewTarget);
        assert_eq!(parse_response("  new_target\r\n"), Message::NewTarget);
        assert_eq!(parse_response("target"), Message::TargetAck);
    }

    #[test]
    fn executing_preserves_raw_text() {
        assert_eq!(parse_response("executing foo"), Message::Executing("executing foo".into()));
        assert_eq!(
            parse_response("step 3 executing now"),
            Message::Executing("step 3 executing now".into())
        );
    }

    #[test]
    fn data_packets_are_decoded_in_field_order() {
        assert_eq!(
            parse_response("1.0 2.0 3.0 4.0 #"),
            Message::Data(ControlCommand::new(1.0, 2.0, 3.0, 4.0))
        );
        assert_eq!(
            parse_response("1.0 2.0 3.0 4.0#"),
            Message::Data(ControlCommand::new(1.0, 2.0, 3.0, 4.0))
        );
    }

    #[test]
    fn unrecognised_text_is_unknown() {
        assert_eq!(parse_response("garbage"), Message::Unknown("garbage".into()));
        assert_eq!(parse_response("1 2 3 #"), Message::Unknown("1 2 3 #".into()));
        assert_eq!(parse_response("1 2 3 4 5 #"), Message::Unknown("1 2 3 4 5 #".into()));
    }

    #[test]
    fn bad_numbers_are_malformed() {
        assert!(matches!(parse_response("1.0 two 3.0 4.0 #"), Message::Malformed(_)));
        assert!(matches!(parse_response("1.0 NaN 3.0 4.0 #"), Message::Malformed(_)));
        assert!(matches!(parse_response("   "), Message::Malformed(_)));
    }

    #[test]
    fn validation_rules() {
        assert!(validate_packet("10 5 9.5 10 #"));
        assert!(!validate_packet(""));
        assert!(!validate_packet("10 5 9.5 10"));
        assert!(!validate_packet("10 5 9.5 #"));
        assert!(!validate_packet("10 5 x 10 #"));
        assert!(!validate_packet("10 5 inf 10 #"));
    }

    #[test]
    fn non_finite_values_are_not_formatted() {
        assert_eq!(format_control_packet(f64::NAN, 1.0, 1.0, 1.0), None);
        assert_eq!(format_control_packet(1.0, f64::INFINITY, 1.0, 1.0), None);
    }

    #[test]
    fn continuation_commands_zero_the_target() {
        let command = ControlCommand::continuation(12.5, 8.25, 10.0);
        assert!(command.is_continuation());
        assert_eq!(command.to_packet().as_deref(), Some("0 12.5 8.25 10 #"));
    }

    #[test]
    fn telemetry_sentinel_is_no_sample() {
        assert_eq!(parse_telemetry("9 9 9").unwrap(), None);
        assert_eq!(parse_telemetry(" 9 9 9\n").unwrap(), None);
    }

    #[test]
    fn telemetry_samples_are_decoded() {
        assert_eq!(
            parse_telemetry("0.95 0.2 10.0 3.5").unwrap(),
            Some(TelemetrySample {
                accuracy: 0.95,
                difference: 0.2,
                target_weight: 10.0,
                elapsed_time: 3.5
            })
        );

        let with_extra = parse_telemetry("1 2 3 4 5 6").unwrap().unwrap();
        assert_eq!(with_extra.elapsed_time, 4.0);
    }

    #[test]
    fn short_or_bad_telemetry_is_an_error() {
        assert!(matches!(parse_telemetry("1 2 3"), Err(DoserError::Protocol { .. })));
        assert!(matches!(parse_telemetry("1 2 x 4"), Err(DoserError::Protocol { .. })));
        assert!(parse_telemetry("").is_err());
    }

    #[test]
    fn telemetry_serializes_with_legacy_field_names() {
        let sample =
            TelemetrySample {
                accuracy: 0.9,
                difference: 0.1,
                target_weight: 5.0,
                elapsed_time: 2.0,
            };
        let json = serde_json::to_value(sample).unwrap();
        assert_eq!(json["time"], 2.0);
        assert_eq!(json["accuracy"], 0.9);
    }
}
