use crate::id::SessionId;
use crate::path::PathBuf;
use proptest::prelude::*;

/// Segment values, heavy on the reserved characters so escaping gets
/// exercised.
pub fn arb_segment() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z0-9éß%/\\\\._-]{1,12}").unwrap()
}

pub fn arb_path() -> impl Strategy<Value = PathBuf> {
    prop::collection::vec(arb_segment(), 0..4).prop_map(|segments| segments.into_iter().collect())
}

pub fn arb_session_id() -> impl Strategy<Value = SessionId> {
    (any::<[u8; 16]>(), "[a-z][a-z0-9-]{0,11}")
        .prop_map(|(prefix, address)| SessionId::new(prefix, &address))
}
