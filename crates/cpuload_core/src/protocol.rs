//! Protocolo de publicação.
//!
//! Payload JSON puro, sem header nem compressão:
//!
//! ```text
//! tópico:  <base>/<iid>/<key>
//! payload: {"iid":"sensor-1","key":"cpu","time":"…","value":42.5}
//! ```

use crate::types::Message;

/// Erros do protocolo.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Erro de serialização: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Valor não numérico: {0}")]
    NonFiniteValue(f64),
}

/// Codifica uma [`Message`] em JSON compacto.
///
/// `value` precisa ser finito: o JSON não tem NaN nem infinito.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    if !message.value.is_finite() {
        return Err(ProtocolError::NonFiniteValue(message.value));
    }
    Ok(serde_json::to_vec(message)?)
}

/// Monta o tópico `{base}/{iid}/{key}` sem separadores extras.
pub fn topic_for(base: &str, iid: &str, key: &str) -> String {
    format!("{base}/{iid}/{key}")
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_fields_in_order() {
        let msg = Message::new("sensor-1", "cpu", "2024-01-01T00:00:00Z", 42.5);
        let encoded = encode_message(&msg).unwrap();
        assert_eq!(
            String::from_utf8(encoded).unwrap(),
            r#"{"iid":"sensor-1","key":"cpu","time":"2024-01-01T00:00:00Z","value":42.5}"#
        );
    }

    #[test]
    fn whole_values_stay_numeric() {
        let msg = Message::new("a", "b", "t", 0.0);
        let json: serde_json::Value = serde_json::from_slice(&encode_message(&msg).unwrap()).unwrap();
        assert!(json["value"].is_number());
        assert_eq!(json["value"].as_f64(), Some(0.0));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let msg = Message::new("i", "k", "t", value);
            assert!(matches!(
                encode_message(&msg),
                Err(ProtocolError::NonFiniteValue(_))
            ));
        }
    }

    #[test]
    fn topic_has_exactly_two_separators() {
        assert_eq!(topic_for("base", "iid", "key"), "base/iid/key");
        assert_eq!(topic_for("plant/floor1", "host-7", "cpu"), "plant/floor1/host-7/cpu");
    }

    #[test]
    fn empty_parts_are_kept_verbatim() {
        assert_eq!(topic_for("", "iid", ""), "/iid/");
    }
}
