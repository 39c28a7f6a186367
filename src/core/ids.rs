//! Purpose: Generate backend-style record identifiers.
//! Exports: `auto_id`, `AUTO_ID_LEN`.
//! Invariants: Ids are `AUTO_ID_LEN` ASCII alphanumerics drawn from OS randomness.
//! Invariants: Sampling rejects biased bytes so every symbol is equally likely.

use getrandom::fill as fill_random;

use crate::core::error::{Error, ErrorKind};

pub const AUTO_ID_LEN: usize = 20;

const ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
// Largest multiple of 62 that fits in a byte.
const ACCEPT_BELOW: u8 = 248;

pub fn auto_id() -> Result<String, Error> {
    let mut out = String::with_capacity(AUTO_ID_LEN);
    let mut buf = [0u8; 32];
    while out.len() < AUTO_ID_LEN {
        fill_random(&mut buf).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to read OS randomness")
                .with_hint(err.to_string())
        })?;
        for byte in buf {
            if out.len() == AUTO_ID_LEN {
                break;
            }
            if byte < ACCEPT_BELOW {
                out.push(ALPHABET[(byte % 62) as usize] as char);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{AUTO_ID_LEN, auto_id};

    #[test]
    fn ids_have_expected_shape() {
        let id = auto_id().expect("id");
        assert_eq!(id.len(), AUTO_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn ids_do_not_repeat() {
        let first = auto_id().expect("id");
        let second = auto_id().expect("id");
        assert_ne!(first, second);
    }
}
