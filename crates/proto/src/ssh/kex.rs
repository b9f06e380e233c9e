//! Algorithm negotiation (KEXINIT) and the NEWKEYS marker.
//!
//! # Key Exchange Flow
//!
//! 1. Initiator sends KEXINIT, responder answers with its own
//! 2. Both sides run [`select_first_match`] with the initiator's lists first
//! 3. Diffie-Hellman exchange ([`kex_dh`](super::kex_dh))
//! 4. Both sides send NEWKEYS and switch to the encrypted envelope
//!
//! # Example
//!
//! ```rust
//! use kimcloud_proto::ssh::kex::{select_first_match, AlgorithmLists, KexInit, NewKeys};
//!
//! let lists = AlgorithmLists::default();
//! let kexinit = KexInit::new(lists.clone(), &mut rand::rngs::OsRng);
//! let parsed = KexInit::from_bytes(&kexinit.to_bytes()).unwrap();
//!
//! let negotiated = select_first_match(parsed.lists(), &lists).unwrap();
//! assert_eq!(negotiated.kex, "diffie-hellman-simple");
//!
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use crate::ssh::message::MessageType;
use bytes::{BufMut, BytesMut};
use kimcloud_platform::{CloudError, CloudResult};
use rand::{CryptoRng, RngCore};

/// Number of name-lists carried by KEXINIT.
pub const NAME_LIST_COUNT: usize = 10;

/// Ordered algorithm preferences for every category, most preferred first.
///
/// Built once per handshake and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmLists {
    /// Key exchange algorithms
    pub kex: Vec<String>,
    /// Host key algorithms
    pub host_key: Vec<String>,
    /// Encryption algorithms client to server
    pub encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    pub encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    pub mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    pub mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    pub compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    pub compression_server_to_client: Vec<String>,
    /// Language tags client to server (not negotiated)
    pub languages_client_to_server: Vec<String>,
    /// Language tags server to client (not negotiated)
    pub languages_server_to_client: Vec<String>,
}

impl AlgorithmLists {
    /// Returns the ten lists in wire order.
    fn in_wire_order(&self) -> [&Vec<String>; NAME_LIST_COUNT] {
        [
            &self.kex,
            &self.host_key,
            &self.encryption_client_to_server,
            &self.encryption_server_to_client,
            &self.mac_client_to_server,
            &self.mac_server_to_client,
            &self.compression_client_to_server,
            &self.compression_server_to_client,
            &self.languages_client_to_server,
            &self.languages_server_to_client,
        ]
    }

    /// Returns the name of the first negotiated category that is empty, if any.
    pub fn first_empty_category(&self) -> Option<&'static str> {
        CATEGORY_NAMES
            .iter()
            .zip(self.in_wire_order())
            .take(NEGOTIATED_CATEGORY_COUNT)
            .find(|(_, list)| list.is_empty())
            .map(|(name, _)| *name)
    }
}

impl Default for AlgorithmLists {
    /// The only algorithm set this implementation speaks.
    fn default() -> Self {
        let one = |name: &str| vec![name.to_string()];
        Self {
            kex: one("diffie-hellman-simple"),
            host_key: one("placeholder-hostkey"),
            encryption_client_to_server: one("simple-xor-stream"),
            encryption_server_to_client: one("simple-xor-stream"),
            mac_client_to_server: one("simple-rotate-mac"),
            mac_server_to_client: one("simple-rotate-mac"),
            compression_client_to_server: one("none"),
            compression_server_to_client: one("none"),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
        }
    }
}

/// Categories in wire order; the last two are language tags.
static CATEGORY_NAMES: [&str; NAME_LIST_COUNT] = [
    "kex",
    "host_key",
    "encryption_client_to_server",
    "encryption_server_to_client",
    "mac_client_to_server",
    "mac_server_to_client",
    "compression_client_to_server",
    "compression_server_to_client",
    "languages_client_to_server",
    "languages_server_to_client",
];

const NEGOTIATED_CATEGORY_COUNT: usize = 8;

/// One selected algorithm per negotiated category.
///
/// Only ever constructed by [`select_first_match`], which either fills every
/// field or fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange
    pub kex: String,
    /// Host key
    pub host_key: String,
    /// Encryption client to server
    pub encryption_client_to_server: String,
    /// Encryption server to client
    pub encryption_server_to_client: String,
    /// MAC client to server
    pub mac_client_to_server: String,
    /// MAC server to client
    pub mac_server_to_client: String,
    /// Compression client to server
    pub compression_client_to_server: String,
    /// Compression server to client
    pub compression_server_to_client: String,
}

/// KEXINIT message.
///
/// ```text
/// byte         MSG_KEXINIT (0x14)
/// byte[16]     cookie (random bytes)
/// name-list    x 10 (uint32 length + comma-joined names)
/// boolean      first_kex_packet_follows (always 0 when sent)
/// uint32       0 (reserved)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    lists: AlgorithmLists,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with a fresh random cookie.
    pub fn new<R: RngCore + CryptoRng>(lists: AlgorithmLists, rng: &mut R) -> Self {
        let mut cookie = [0u8; 16];
        rng.fill_bytes(&mut cookie);

        Self {
            cookie,
            lists,
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the advertised algorithm lists.
    pub fn lists(&self) -> &AlgorithmLists {
        &self.lists
    }

    /// Consumes the message, returning its algorithm lists.
    pub fn into_lists(self) -> AlgorithmLists {
        self.lists
    }

    /// Returns whether the peer claimed a guessed KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT payload (without packet framing).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        for list in self.lists.in_wire_order() {
            write_name_list(&mut buf, list);
        }

        buf.put_u8(u8::from(self.first_kex_packet_follows));
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT payload.
    ///
    /// The trailing boolean and reserved field are read when present but a
    /// payload that ends right after the tenth list is still accepted.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::MalformedNegotiation`] if:
    /// - The first byte is not 0x14
    /// - The cookie is truncated
    /// - A declared list length overruns the buffer
    /// - A list is not valid UTF-8
    pub fn from_bytes(data: &[u8]) -> CloudResult<Self> {
        if data.first() != Some(&(MessageType::KexInit as u8)) {
            return Err(CloudError::MalformedNegotiation(format!(
                "Invalid message type: expected 0x14 (MSG_KEXINIT), got {:?}",
                data.first()
            )));
        }

        if data.len() < 17 {
            return Err(CloudError::MalformedNegotiation(format!(
                "KEXINIT too short: {} bytes (minimum 17)",
                data.len()
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[1..17]);

        let mut offset = 17;
        let mut lists: Vec<Vec<String>> = Vec::with_capacity(NAME_LIST_COUNT);
        for _ in 0..NAME_LIST_COUNT {
            lists.push(read_name_list(data, &mut offset)?);
        }

        let first_kex_packet_follows = data.get(offset).is_some_and(|b| *b != 0);

        let mut lists = lists.into_iter();
        let mut next = || lists.next().unwrap_or_default();

        Ok(Self {
            cookie,
            lists: AlgorithmLists {
                kex: next(),
                host_key: next(),
                encryption_client_to_server: next(),
                encryption_server_to_client: next(),
                mac_client_to_server: next(),
                mac_server_to_client: next(),
                compression_client_to_server: next(),
                compression_server_to_client: next(),
                languages_client_to_server: next(),
                languages_server_to_client: next(),
            },
            first_kex_packet_follows,
        })
    }
}

/// NEWKEYS message: a single byte, 21.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::KeyExchange`] if the payload is empty or does not
    /// start with 21.
    pub fn from_bytes(data: &[u8]) -> CloudResult<Self> {
        match data.first() {
            Some(&b) if b == MessageType::NewKeys as u8 => Ok(Self),
            Some(&b) => Err(CloudError::KeyExchange(format!(
                "Invalid message type: expected 21 (MSG_NEWKEYS), got {}",
                b
            ))),
            None => Err(CloudError::KeyExchange(
                "NEWKEYS message is empty".to_string(),
            )),
        }
    }
}

/// Writes a name-list: uint32 length + comma-joined names.
fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    let list = names.join(",");
    buf.put_u32(list.len() as u32);
    buf.put_slice(list.as_bytes());
}

/// Reads a name-list: uint32 length + comma-joined names.
fn read_name_list(data: &[u8], offset: &mut usize) -> CloudResult<Vec<String>> {
    let Some(len_bytes) = data.get(*offset..*offset + 4) else {
        return Err(CloudError::MalformedNegotiation(format!(
            "Cannot read name-list length at offset {}",
            offset
        )));
    };
    let length = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
    *offset += 4;

    let end = offset
        .checked_add(length as usize)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            CloudError::MalformedNegotiation(format!(
                "Name-list overruns buffer: {} bytes declared at offset {}",
                length, offset
            ))
        })?;

    let list_str = std::str::from_utf8(&data[*offset..end]).map_err(|_| {
        CloudError::MalformedNegotiation("Name-list contains invalid UTF-8".to_string())
    })?;
    *offset = end;

    if list_str.is_empty() {
        Ok(vec![])
    } else {
        Ok(list_str.split(',').map(String::from).collect())
    }
}

/// Selects one algorithm from two preference lists.
///
/// Walks `initiator_list` in order and returns the first entry that appears
/// anywhere in `responder_list`.
///
/// # Errors
///
/// Returns [`CloudError::NegotiationFailure`] if the lists share no entry.
///
/// # Example
///
/// ```rust
/// use kimcloud_proto::ssh::kex::negotiate_algorithm;
///
/// let initiator = vec!["a".to_string(), "b".to_string(), "c".to_string()];
/// let responder = vec!["c".to_string(), "b".to_string()];
///
/// assert_eq!(negotiate_algorithm(&initiator, &responder).unwrap(), "b");
/// ```
pub fn negotiate_algorithm(initiator_list: &[String], responder_list: &[String]) -> CloudResult<String> {
    initiator_list
        .iter()
        .find(|candidate| responder_list.contains(candidate))
        .cloned()
        .ok_or_else(|| {
            CloudError::NegotiationFailure(format!(
                "No common algorithm: initiator={:?}, responder={:?}",
                initiator_list, responder_list
            ))
        })
}

/// Negotiates every category except the two language-tag lists.
///
/// Fails as soon as one category has no common entry; there is no partial
/// result.
///
/// # Errors
///
/// Returns [`CloudError::NegotiationFailure`] naming the failing category.
pub fn select_first_match(
    initiator: &AlgorithmLists,
    responder: &AlgorithmLists,
) -> CloudResult<NegotiatedAlgorithms> {
    Ok(NegotiatedAlgorithms {
        kex: pick("kex", &initiator.kex, &responder.kex)?,
        host_key: pick("host_key", &initiator.host_key, &responder.host_key)?,
        encryption_client_to_server: pick(
            "encryption_client_to_server",
            &initiator.encryption_client_to_server,
            &responder.encryption_client_to_server,
        )?,
        encryption_server_to_client: pick(
            "encryption_server_to_client",
            &initiator.encryption_server_to_client,
            &responder.encryption_server_to_client,
        )?,
        mac_client_to_server: pick(
            "mac_client_to_server",
            &initiator.mac_client_to_server,
            &responder.mac_client_to_server,
        )?,
        mac_server_to_client: pick(
            "mac_server_to_client",
            &initiator.mac_server_to_client,
            &responder.mac_server_to_client,
        )?,
        compression_client_to_server: pick(
            "compression_client_to_server",
            &initiator.compression_client_to_server,
            &responder.compression_client_to_server,
        )?,
        compression_server_to_client: pick(
            "compression_server_to_client",
            &initiator.compression_server_to_client,
            &responder.compression_server_to_client,
        )?,
    })
}

/// Negotiates one category, prefixing any failure with the category name.
fn pick(category: &str, initiator: &[String], responder: &[String]) -> CloudResult<String> {
    negotiate_algorithm(initiator, responder).map_err(|e| match e {
        CloudError::NegotiationFailure(msg) => {
            CloudError::NegotiationFailure(format!("{}: {}", category, msg))
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_kexinit_serialization() {
        let kexinit = KexInit::new(AlgorithmLists::default(), &mut OsRng);
        let bytes = kexinit.to_bytes();

        assert_eq!(bytes[0], 0x14);
        assert_eq!(&bytes[1..17], kexinit.cookie());
        // boolean + reserved uint32 close the message
        assert_eq!(&bytes[bytes.len() - 5..], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_kexinit_round_trip() {
        let mut lists = AlgorithmLists::default();
        lists.encryption_client_to_server = names(&["simple-xor-stream", "other-cipher"]);
        lists.languages_server_to_client = names(&["en-US"]);

        let original = KexInit::new(lists, &mut OsRng);
        let parsed = KexInit::from_bytes(&original.to_bytes()).unwrap();

        assert_eq!(parsed, original);
        assert!(parsed.lists().languages_client_to_server.is_empty());
    }

    #[test]
    fn test_kexinit_parse_invalid_type() {
        let mut data = vec![99];
        data.extend_from_slice(&[0u8; 60]);

        match KexInit::from_bytes(&data) {
            Err(CloudError::MalformedNegotiation(msg)) => {
                assert!(msg.contains("Invalid message type"));
            }
            _ => panic!("Expected MalformedNegotiation error"),
        }
    }

    #[test]
    fn test_kexinit_parse_list_overrun() {
        let mut data = vec![0x14];
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(b"short");

        match KexInit::from_bytes(&data) {
            Err(CloudError::MalformedNegotiation(msg)) => assert!(msg.contains("overruns")),
            _ => panic!("Expected MalformedNegotiation error"),
        }
    }

    #[test]
    fn test_kexinit_parse_too_short() {
        assert!(matches!(
            KexInit::from_bytes(&[0x14, 1, 2, 3]),
            Err(CloudError::MalformedNegotiation(_))
        ));
        assert!(matches!(
            KexInit::from_bytes(&[]),
            Err(CloudError::MalformedNegotiation(_))
        ));
    }

    #[test]
    fn test_negotiate_algorithm_initiator_order_wins() {
        let initiator = names(&["a", "b", "c"]);
        let responder = names(&["c", "b"]);
        assert_eq!(negotiate_algorithm(&initiator, &responder).unwrap(), "b");
    }

    #[test]
    fn test_negotiate_algorithm_no_match() {
        let result = negotiate_algorithm(&names(&["x"]), &names(&["y"]));
        match result {
            Err(CloudError::NegotiationFailure(msg)) => assert!(msg.contains("No common algorithm")),
            _ => panic!("Expected NegotiationFailure"),
        }
    }

    #[test]
    fn test_select_first_match_all_categories() {
        let mut initiator = AlgorithmLists::default();
        initiator.mac_client_to_server = names(&["fancy-mac", "simple-rotate-mac"]);
        let mut responder = AlgorithmLists::default();
        responder.mac_client_to_server = names(&["simple-rotate-mac", "fancy-mac"]);
        responder.languages_client_to_server = names(&["fr"]);

        let negotiated = select_first_match(&initiator, &responder).unwrap();
        assert_eq!(negotiated.mac_client_to_server, "fancy-mac");
        assert_eq!(negotiated.kex, "diffie-hellman-simple");
        assert_eq!(negotiated.compression_server_to_client, "none");
    }

    #[test]
    fn test_select_first_match_fails_whole_negotiation() {
        let initiator = AlgorithmLists::default();
        let mut responder = AlgorithmLists::default();
        responder.compression_server_to_client = names(&["zlib"]);

        match select_first_match(&initiator, &responder) {
            Err(CloudError::NegotiationFailure(msg)) => {
                assert!(msg.starts_with("compression_server_to_client"));
            }
            _ => panic!("Expected NegotiationFailure"),
        }
    }

    #[test]
    fn test_languages_not_negotiated() {
        let mut initiator = AlgorithmLists::default();
        initiator.languages_client_to_server = names(&["en"]);
        let mut responder = AlgorithmLists::default();
        responder.languages_client_to_server = names(&["de"]);

        assert!(select_first_match(&initiator, &responder).is_ok());
    }

    #[test]
    fn test_first_empty_category() {
        let mut lists = AlgorithmLists::default();
        assert_eq!(lists.first_empty_category(), None);
        lists.host_key.clear();
        assert_eq!(lists.first_empty_category(), Some("host_key"));
    }

    #[test]
    fn test_name_list_empty() {
        let mut buf = BytesMut::new();
        write_name_list(&mut buf, &[]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);

        let mut offset = 0;
        assert!(read_name_list(&buf, &mut offset).unwrap().is_empty());
        assert_eq!(offset, 4);
    }

    #[test]
    fn test_newkeys_round_trip() {
        let bytes = NewKeys::new().to_bytes();
        assert_eq!(bytes, vec![21]);
        assert_eq!(NewKeys::from_bytes(&bytes).unwrap(), NewKeys);
        assert!(NewKeys::from_bytes(&[]).is_err());
        assert!(NewKeys::from_bytes(&[20]).is_err());
    }
}
