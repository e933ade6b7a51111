use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

/// Number of random bytes prepended to the return address.
const PREFIX_LEN: usize = 16;

/// A physical address usable as a message destination.
///
/// The coordination core is parameterized once over this capability set:
/// equality, hashing, and a string encoding that survives a round trip
/// through a session identifier.
pub trait Address: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static {
    /// Encodes the address as a string.
    fn encode(&self) -> String;
    /// Decodes an address from its string form.
    fn decode(s: &str) -> Option<Self>;
}

impl Address for String {
    fn encode(&self) -> String {
        self.clone()
    }

    fn decode(s: &str) -> Option<Self> {
        Some(s.to_owned())
    }
}

/// An opaque identifier that uniquely names a session and carries its return
/// address: a random prefix followed by the UTF-8 encoding of the address the
/// owning process receives exchange messages on.
#[derive(
    Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, Deserialize, Serialize,
)]
#[archive_attr(derive(Debug, Eq, Hash, PartialEq, CheckBytes))]
#[repr(C)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    /// Generates a fresh identifier for a session reachable at `address`.
    pub fn generate<A: Address>(address: &A) -> Self {
        let mut prefix = [0; PREFIX_LEN];
        getrandom::getrandom(&mut prefix).expect("system rng");
        Self::new(prefix, &address.encode())
    }

    pub fn new(prefix: [u8; PREFIX_LEN], address: &str) -> Self {
        let mut bytes = Vec::with_capacity(PREFIX_LEN + address.len());
        bytes.extend_from_slice(&prefix);
        bytes.extend_from_slice(address.as_bytes());
        Self(bytes)
    }

    pub fn prefix(&self) -> &[u8] {
        &self.0[..PREFIX_LEN]
    }

    /// The string form of the return address carried by this identifier.
    pub fn address_str(&self) -> &str {
        // Constructors only ever append valid UTF-8 after the prefix.
        std::str::from_utf8(&self.0[PREFIX_LEN..]).expect("address bytes are utf-8")
    }

    /// Decodes the return address.
    pub fn address<A: Address>(&self) -> Option<A> {
        A::decode(self.address_str())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}",
            base64::encode_config(&self.0, base64::URL_SAFE_NO_PAD)
        )
    }
}

impl std::str::FromStr for SessionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = base64::decode_config(s, base64::URL_SAFE_NO_PAD)?;
        if bytes.len() < PREFIX_LEN {
            return Err(anyhow::anyhow!("session id too short: {} bytes", bytes.len()));
        }
        std::str::from_utf8(&bytes[PREFIX_LEN..])?;
        Ok(Self(bytes))
    }
}
