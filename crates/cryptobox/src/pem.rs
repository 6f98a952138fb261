//! Minimal PEM armor

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::BoxError;

/// One `-----BEGIN label-----` ... `-----END label-----` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBlock {
    pub label: String,
    pub data: Vec<u8>,
}

/// Extract every PEM block from `input`.
///
/// Text outside blocks is ignored; non-UTF-8 input has no blocks.
pub fn parse_pem(input: &[u8]) -> Result<Vec<PemBlock>, BoxError> {
    let Ok(text) = std::str::from_utf8(input) else {
        return Ok(Vec::new());
    };

    let mut blocks = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in text.lines().map(str::trim) {
        match current.as_mut() {
            None => {
                if let Some(label) = armor_label(line, "BEGIN") {
                    current = Some((label.to_owned(), String::new()));
                }
            }
            Some((label, body)) => {
                if let Some(end) = armor_label(line, "END") {
                    if end != label.as_str() {
                        return Err(BoxError::Malformed(format!(
                            "PEM block {label} closed as {end}"
                        )));
                    }
                    let data = STANDARD
                        .decode(body.as_bytes())
                        .map_err(|e| BoxError::Malformed(format!("PEM body: {e}")))?;
                    blocks.push(PemBlock {
                        label: std::mem::take(label),
                        data,
                    });
                    current = None;
                } else {
                    body.push_str(line);
                }
            }
        }
    }

    if let Some((label, _)) = current {
        return Err(BoxError::Malformed(format!("PEM block {label} not closed")));
    }
    Ok(blocks)
}

fn armor_label<'a>(line: &'a str, kind: &str) -> Option<&'a str> {
    line.strip_prefix("-----")?
        .strip_prefix(kind)?
        .strip_prefix(' ')?
        .strip_suffix("-----")
}

/// Armor `data` under `label`, 64 columns per line
pub fn encode_pem(label: &str, data: &[u8]) -> String {
    let body = STANDARD.encode(data);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in body.as_bytes().chunks(64) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse() {
        let data: Vec<u8> = (0..100).collect();
        let pem = encode_pem("ED25519 PUBLIC KEY", &data);
        assert!(pem.lines().all(|l| l.len() <= 64 || l.starts_with("-----")));

        let blocks = parse_pem(pem.as_bytes()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label, "ED25519 PUBLIC KEY");
        assert_eq!(blocks[0].data, data);
    }

    #[test]
    fn test_multiple_blocks_with_noise() {
        let text = format!(
            "subject: test\n{}garbage\n{}",
            encode_pem("CERTIFICATE", b"one"),
            encode_pem("CERTIFICATE", b"two")
        );
        let blocks = parse_pem(text.as_bytes()).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].data, b"two");
    }

    #[test]
    fn test_binary_has_no_blocks() {
        assert!(parse_pem(&[0xFF, 0x00, 0x13]).unwrap().is_empty());
    }

    #[test]
    fn test_unterminated_block() {
        assert!(parse_pem(b"-----BEGIN CERTIFICATE-----\nAAAA\n").is_err());
    }

    #[test]
    fn test_mismatched_end() {
        let text = "-----BEGIN A-----\nAAAA\n-----END B-----\n";
        assert!(matches!(parse_pem(text.as_bytes()), Err(BoxError::Malformed(_))));
    }
}
