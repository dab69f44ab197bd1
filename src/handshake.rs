//! Pieces shared by the client and server sides of the HTTP Upgrade
//! handshake.

use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing
/// (RFC 6455 Section 1.3).
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this engine speaks.
pub(crate) const WS_VERSION: &str = "13";

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub(crate) fn accept_key(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WS_GUID);
    let digest = sha1.finalize();
    BASE64_STANDARD.encode(&digest[..])
}

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub(crate) fn generate_key() -> String {
    use base64::prelude::*;
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Splits a comma-separated header value into trimmed non-empty tokens.
pub(crate) fn split_header_list(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect()
}

/// Case-insensitive search for `token` among the comma-separated entries of
/// a header value (how `Connection: keep-alive, Upgrade` is matched).
pub(crate) fn header_contains(value: &str, token: &str) -> bool {
    split_header_list(value)
        .iter()
        .any(|entry| entry.eq_ignore_ascii_case(token))
}

/// Picks the subprotocol: the first of the client's preferences that the
/// server also speaks.
pub(crate) fn select_subprotocol(client: &[&str], server: &[String]) -> Option<String> {
    client
        .iter()
        .find(|requested| server.iter().any(|offered| offered == *requested))
        .map(|name| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        // The worked example from RFC 6455 Section 1.3.
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generated_keys_are_unique_base64() {
        use base64::prelude::*;
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(BASE64_STANDARD.decode(&a).unwrap().len(), 16);
    }

    #[test]
    fn test_split_header_list() {
        assert_eq!(
            split_header_list("chat.v2, chat.v1 ,,graphql-ws"),
            vec!["chat.v2", "chat.v1", "graphql-ws"]
        );
        assert!(split_header_list("").is_empty());
    }

    #[test]
    fn test_header_contains_is_case_insensitive() {
        assert!(header_contains("keep-alive, Upgrade", "upgrade"));
        assert!(header_contains("UPGRADE", "Upgrade"));
        assert!(!header_contains("keep-alive", "upgrade"));
    }

    #[test]
    fn test_select_subprotocol_client_order_wins() {
        let server = vec!["chat.v1".to_string(), "chat.v2".to_string()];
        // Client prefers v2; the server speaks both, so v2 wins.
        assert_eq!(
            select_subprotocol(&["chat.v2", "chat.v1"], &server),
            Some("chat.v2".to_string())
        );
        assert_eq!(
            select_subprotocol(&["chat.v3", "chat.v1"], &server),
            Some("chat.v1".to_string())
        );
        assert_eq!(select_subprotocol(&["chat.v3"], &server), None);
        assert_eq!(select_subprotocol(&[], &server), None);
    }
}
