// ABOUTME: Access token layout for the SQL Server driver's pre-connect attribute
// ABOUTME: Packs tokens as i32 length prefix + UTF-16LE bytes and unpacks them on connect

use std::collections::BTreeMap;
use thiserror::Error;

use super::credential::{CredentialError, TokenCredential};

/// Driver attribute that carries a packed access token
pub const SQL_COPT_SS_ACCESS_TOKEN: i32 = 1256;

/// Token scope for Azure SQL Database
pub const DATABASE_SCOPE: &str = "https://database.windows.net/";

const LENGTH_PREFIX: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Packed token is truncated: {0} bytes")]
    Truncated(usize),
    #[error("Packed token length prefix {prefix} does not match payload of {actual} bytes")]
    LengthMismatch { prefix: i32, actual: usize },
    #[error("Packed token is not valid UTF-16")]
    InvalidUtf16,
    #[error("Token of {0} bytes does not fit the i32 length prefix")]
    TooLong(usize),
}

fn length_prefix(len: usize) -> Result<[u8; LENGTH_PREFIX], TokenError> {
    let len = i32::try_from(len).map_err(|_| TokenError::TooLong(len))?;
    Ok(len.to_le_bytes())
}

/// Pack an access token into the length-prefixed UTF-16LE layout.
pub fn pack_access_token(token: &str) -> Result<Vec<u8>, TokenError> {
    let encoded: Vec<u8> = token.encode_utf16().flat_map(u16::to_le_bytes).collect();

    let mut packed = Vec::with_capacity(LENGTH_PREFIX + encoded.len());
    packed.extend_from_slice(&length_prefix(encoded.len())?);
    packed.extend_from_slice(&encoded);
    Ok(packed)
}

/// Recover the token string from a packed attribute
pub fn unpack_access_token(packed: &[u8]) -> Result<String, TokenError> {
    if packed.len() < LENGTH_PREFIX {
        return Err(TokenError::Truncated(packed.len()));
    }

    let (prefix, payload) = packed.split_at(LENGTH_PREFIX);
    let declared = i32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);

    if declared < 0 || declared as usize != payload.len() || payload.len() % 2 != 0 {
        return Err(TokenError::LengthMismatch {
            prefix: declared,
            actual: payload.len(),
        });
    }

    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    String::from_utf16(&units).map_err(|_| TokenError::InvalidUtf16)
}

/// Fetch a database-scoped token from `credential` and pack it
pub async fn db_aad_token_struct(
    credential: &dyn TokenCredential,
) -> Result<Vec<u8>, CredentialError> {
    let token = credential.get_token(DATABASE_SCOPE).await?;
    Ok(pack_access_token(token.secret())?)
}

/// Attributes applied to a connection before login, keyed by driver attribute id
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectAttrs(BTreeMap<i32, Vec<u8>>);

impl ConnectAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes carrying a single packed access token
    pub fn with_access_token(packed: Vec<u8>) -> Self {
        let mut attrs = Self::new();
        attrs.insert(SQL_COPT_SS_ACCESS_TOKEN, packed);
        attrs
    }

    pub fn insert(&mut self, key: i32, value: Vec<u8>) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: i32) -> Option<&[u8]> {
        self.0.get(&key).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The unpacked access token, if one was supplied
    pub fn access_token(&self) -> Result<Option<String>, TokenError> {
        self.get(SQL_COPT_SS_ACCESS_TOKEN)
            .map(unpack_access_token)
            .transpose()
    }
}

impl std::fmt::Debug for ConnectAttrs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Values are secrets; show only which attributes are present and their size
        f.debug_map()
            .entries(self.0.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credential::{AccessToken, StaticTokenCredential};

    fn prefix(packed: &[u8]) -> i32 {
        i32::from_le_bytes([packed[0], packed[1], packed[2], packed[3]])
    }

    #[test]
    fn test_pack_prefixes_utf16_byte_length() {
        let packed = pack_access_token("abc").unwrap();
        assert_eq!(prefix(&packed), 6);
        assert_eq!(&packed[4..], &[b'a', 0, b'b', 0, b'c', 0]);
    }

    #[test]
    fn test_pack_empty_token() {
        assert_eq!(pack_access_token("").unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_pack_counts_surrogate_pairs() {
        // One BMP char (2 bytes) + one astral char (surrogate pair, 4 bytes)
        let token = "é😀";
        let packed = pack_access_token(token).unwrap();
        assert_eq!(prefix(&packed), 6);
        assert_eq!(packed.len(), 10);

        let expected: Vec<u8> = token.encode_utf16().flat_map(u16::to_le_bytes).collect();
        assert_eq!(&packed[4..], expected.as_slice());
    }

    #[test]
    fn test_pack_prefix_matches_payload_for_jwt_shaped_tokens() {
        let token = "eyJ0eXAiOiJKV1QiLCJhbGciOiJSUzI1NiJ9.eyJhdWQiOiJodHRwczovL2RhdGFiYXNlIn0.c2ln";
        let packed = pack_access_token(token).unwrap();
        assert_eq!(prefix(&packed) as usize, packed.len() - 4);
        assert_eq!(prefix(&packed) as usize, token.len() * 2);
    }

    #[test]
    fn test_length_prefix_rejects_lengths_beyond_i32() {
        assert_eq!(length_prefix(6).unwrap(), [6, 0, 0, 0]);
        assert_eq!(length_prefix(i32::MAX as usize).unwrap(), i32::MAX.to_le_bytes());

        let too_long = i32::MAX as usize + 1;
        assert_eq!(length_prefix(too_long), Err(TokenError::TooLong(too_long)));
    }

    #[test]
    fn test_unpack_recovers_token() {
        let packed = pack_access_token("token-value").unwrap();
        assert_eq!(unpack_access_token(&packed).unwrap(), "token-value");
    }

    #[test]
    fn test_unpack_rejects_truncated_buffer() {
        assert_eq!(unpack_access_token(&[1, 0]), Err(TokenError::Truncated(2)));
    }

    #[test]
    fn test_unpack_rejects_length_mismatch() {
        let mut packed = pack_access_token("abc").unwrap();
        packed.pop();
        assert_eq!(
            unpack_access_token(&packed),
            Err(TokenError::LengthMismatch {
                prefix: 6,
                actual: 5
            })
        );

        let negative = [0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            unpack_access_token(&negative),
            Err(TokenError::LengthMismatch { prefix: -1, .. })
        ));
    }

    #[test]
    fn test_unpack_rejects_lone_surrogate() {
        let packed = [2, 0, 0, 0, 0x00, 0xd8];
        assert_eq!(unpack_access_token(&packed), Err(TokenError::InvalidUtf16));
    }

    #[test]
    fn test_connect_attrs_carry_token_under_driver_key() {
        let attrs = ConnectAttrs::with_access_token(pack_access_token("secret").unwrap());
        assert!(attrs.get(SQL_COPT_SS_ACCESS_TOKEN).is_some());
        assert_eq!(attrs.access_token().unwrap().as_deref(), Some("secret"));
        assert!(!format!("{:?}", attrs).contains("secret"));

        assert_eq!(ConnectAttrs::new().access_token().unwrap(), None);
    }

    #[tokio::test]
    async fn test_db_aad_token_struct_uses_database_scope() {
        let credential = StaticTokenCredential::new(AccessToken::new(
            "db-token",
            chrono::Utc::now() + chrono::Duration::hours(1),
        ))
        .with_expected_scope(DATABASE_SCOPE);

        let packed = db_aad_token_struct(&credential).await.unwrap();
        assert_eq!(unpack_access_token(&packed).unwrap(), "db-token");
    }
}
