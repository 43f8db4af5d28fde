use core::any::Any;
use core::any::TypeId;
use core::fmt;
use core::hash::BuildHasher;
use core::hash::Hasher;
use std::sync::Arc;

use foldhash::fast::FixedState;

/// Hash codes are narrowed to 31 bits so they divide cleanly in the probe
/// arithmetic regardless of the index array's slot width.
pub(crate) const HASH_MASK: u32 = 0x7FFF_FFFF;

/// Seed for the scalar/string hash states. All tables share one seed so that
/// hashes stored in cloned bucket records stay valid in the clone.
const KEY_SEED: u64 = 0x51ab_7e03_9c4d_f261;

/// Separate seed for tuple hashing so that `(k,)` and `k` do not collide
/// structurally.
const TUPLE_SEED: u64 = 0xd2f1_66a8_0b3e_574f;

/// Canonical bit pattern used to hash every NaN float key.
const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

#[inline(always)]
fn mask(hash: u64) -> u32 {
    hash as u32 & HASH_MASK
}

/// Hashing and equality capability supplied by the embedding environment for
/// key objects outside the fast-pathed primitive kinds.
///
/// Implementations may run arbitrary user-level code; a panic raised from
/// either method propagates unmodified through every table operation that
/// invoked it.
///
/// `eq_key` is only ever called with `other` values that were also stored as
/// [`Key::Obj`] payloads, so implementations typically downcast via
/// [`ObjectKey::as_any`] and compare.
pub trait ObjectKey: Send + Sync + 'static {
    /// Hash this key. The table narrows the result to 31 bits internally.
    fn hash_key(&self) -> u64;

    /// Compare this key against another object key.
    fn eq_key(&self, other: &dyn ObjectKey) -> bool;

    /// The payload as [`Any`], for downcasting and concrete-type identity.
    fn as_any(&self) -> &dyn Any;
}

/// An [`ObjectKey`] keyed by allocation identity.
///
/// Two `IdentityKey`s compare equal only when they are the same heap object,
/// and the hash is derived from the allocation address. This is the key shape
/// for payloads that are opaque to the table (no meaningful value equality).
///
/// # Examples
///
/// ```rust
/// use adapt_hash::{DictTable, IdentityKey, Key};
///
/// let table: DictTable<i32> = DictTable::new();
/// let k = Key::identity("opaque payload");
/// table.add(k.clone(), 1);
/// assert_eq!(table.try_get(&k), Some(1));
/// // A distinct allocation with equal contents is a different key.
/// assert_eq!(table.try_get(&Key::identity("opaque payload")), None);
/// ```
pub struct IdentityKey<T> {
    payload: T,
}

impl<T: Send + Sync + 'static> IdentityKey<T> {
    /// Wrap `payload` in an identity-compared key.
    pub fn new(payload: T) -> Self {
        IdentityKey { payload }
    }

    /// The wrapped payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }
}

impl<T: Send + Sync + 'static> ObjectKey for IdentityKey<T> {
    fn hash_key(&self) -> u64 {
        self as *const Self as usize as u64
    }

    fn eq_key(&self, other: &dyn ObjectKey) -> bool {
        match other.as_any().downcast_ref::<Self>() {
            Some(other) => core::ptr::eq(self, other),
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A dynamically-typed dictionary key.
///
/// The primitive kinds (`Int`, `Str`, `Float`, `Tuple`) carry fast-path
/// hash/equality routines; everything else enters through [`Key::Obj`] and the
/// [`ObjectKey`] abstraction. Keys of different kinds never compare equal:
/// `Key::Int(1)` and `Key::Float(1.0)` are distinct keys.
///
/// Float keys use canonicalized semantics so that every float value works as
/// a key: `-0.0` is the same key as `0.0`, and NaN is equal to NaN.
#[derive(Clone)]
pub enum Key {
    /// The null key. Observing it permanently switches a table to generic
    /// hashing.
    Null,
    /// A signed integer key.
    Int(i64),
    /// A string key.
    Str(Arc<str>),
    /// A float key (canonicalized: `-0.0 == 0.0`, NaN equals NaN).
    Float(f64),
    /// A fixed-size tuple of keys, compared elementwise.
    Tuple(Arc<[Key]>),
    /// An opaque object key, hashed and compared through [`ObjectKey`].
    Obj(Arc<dyn ObjectKey>),
}

impl Key {
    /// Convenience constructor for an identity-compared object key.
    pub fn identity<T: Send + Sync + 'static>(payload: T) -> Self {
        Key::Obj(Arc::new(IdentityKey::new(payload)))
    }

    /// The observed kind of this key, or `None` for the null key.
    pub(crate) fn kind(&self) -> Option<KeyKind> {
        match self {
            Key::Null => None,
            Key::Int(_) => Some(KeyKind::Int),
            Key::Str(_) => Some(KeyKind::Str),
            Key::Float(_) => Some(KeyKind::Float),
            Key::Tuple(_) => Some(KeyKind::Tuple),
            Key::Obj(obj) => Some(KeyKind::Obj(obj.as_any().type_id())),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Null => f.write_str("Null"),
            Key::Int(value) => f.debug_tuple("Int").field(value).finish(),
            Key::Str(value) => f.debug_tuple("Str").field(value).finish(),
            Key::Float(value) => f.debug_tuple("Float").field(value).finish(),
            Key::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Key::Obj(obj) => write!(f, "Obj({:p})", Arc::as_ptr(obj)),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        eq_generic(self, other)
    }
}

// Reflexivity holds because NaN float keys compare equal to each other.
impl Eq for Key {}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<f64> for Key {
    fn from(value: f64) -> Self {
        Key::Float(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Str(Arc::from(value))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Str(Arc::from(value))
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Tuple(Arc::from(items))
    }
}

/// Concrete kind of an observed key, used to track table homogeneity.
///
/// Object keys are tagged with the payload's [`TypeId`], so two object keys of
/// different concrete types count as distinct kinds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum KeyKind {
    Int,
    Str,
    Float,
    Tuple,
    Obj(TypeId),
}

pub(crate) type HashFn = fn(&Key) -> u32;
pub(crate) type EqFn = fn(&Key, &Key) -> bool;

/// Select the hash/equality pair for a table that has observed only keys of
/// `kind`. `None` selects the generic pair.
///
/// Every specialized pair produces bit-identical results to the generic pair
/// for the keys it covers; the specialization only strips the dispatch. This
/// is what keeps a reader that raced a strategy switch correct: hashing the
/// same key through either pair lands on the same probe sequence.
pub(crate) fn ops_for(kind: Option<KeyKind>) -> (HashFn, EqFn) {
    match kind {
        Some(KeyKind::Int) => (hash_int, eq_int),
        Some(KeyKind::Str) => (hash_str, eq_str),
        Some(KeyKind::Float) => (hash_float, eq_float),
        Some(KeyKind::Tuple) => (hash_tuple, eq_tuple),
        Some(KeyKind::Obj(_)) => (hash_obj, eq_obj),
        None => (hash_generic, eq_generic),
    }
}

#[inline(always)]
fn fold_u64(value: u64) -> u32 {
    mask(FixedState::with_seed(KEY_SEED).hash_one(value))
}

#[inline(always)]
fn canonical_float_bits(value: f64) -> u64 {
    if value.is_nan() {
        CANONICAL_NAN
    } else if value == 0.0 {
        // Folds -0.0 onto 0.0.
        0
    } else {
        value.to_bits()
    }
}

fn hash_int(key: &Key) -> u32 {
    match key {
        Key::Int(value) => fold_u64(*value as u64),
        other => hash_generic(other),
    }
}

fn hash_str(key: &Key) -> u32 {
    match key {
        Key::Str(value) => mask(FixedState::with_seed(KEY_SEED).hash_one(&**value)),
        other => hash_generic(other),
    }
}

fn hash_float(key: &Key) -> u32 {
    match key {
        Key::Float(value) => fold_u64(canonical_float_bits(*value)),
        other => hash_generic(other),
    }
}

fn hash_tuple(key: &Key) -> u32 {
    match key {
        Key::Tuple(items) => {
            let mut hasher = FixedState::with_seed(TUPLE_SEED).build_hasher();
            hasher.write_usize(items.len());
            for item in items.iter() {
                hasher.write_u32(hash_generic(item));
            }
            mask(hasher.finish())
        }
        other => hash_generic(other),
    }
}

fn hash_obj(key: &Key) -> u32 {
    match key {
        Key::Obj(obj) => mask(obj.hash_key()),
        other => hash_generic(other),
    }
}

pub(crate) fn hash_generic(key: &Key) -> u32 {
    match key {
        Key::Null => 0,
        Key::Int(value) => fold_u64(*value as u64),
        Key::Str(value) => mask(FixedState::with_seed(KEY_SEED).hash_one(&**value)),
        Key::Float(value) => fold_u64(canonical_float_bits(*value)),
        Key::Tuple(_) => hash_tuple(key),
        Key::Obj(obj) => mask(obj.hash_key()),
    }
}

fn eq_int(a: &Key, b: &Key) -> bool {
    match (a, b) {
        (Key::Int(a), Key::Int(b)) => a == b,
        (a, b) => eq_generic(a, b),
    }
}

fn eq_str(a: &Key, b: &Key) -> bool {
    match (a, b) {
        // Identity short-circuits the byte comparison.
        (Key::Str(a), Key::Str(b)) => Arc::ptr_eq(a, b) || a == b,
        (a, b) => eq_generic(a, b),
    }
}

fn eq_float(a: &Key, b: &Key) -> bool {
    match (a, b) {
        (Key::Float(a), Key::Float(b)) => canonical_float_bits(*a) == canonical_float_bits(*b),
        (a, b) => eq_generic(a, b),
    }
}

fn eq_tuple(a: &Key, b: &Key) -> bool {
    match (a, b) {
        (Key::Tuple(a), Key::Tuple(b)) => {
            Arc::ptr_eq(a, b)
                || (a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| eq_generic(x, y)))
        }
        (a, b) => eq_generic(a, b),
    }
}

fn eq_obj(a: &Key, b: &Key) -> bool {
    match (a, b) {
        (Key::Obj(a), Key::Obj(b)) => Arc::ptr_eq(a, b) || a.eq_key(&**b),
        (a, b) => eq_generic(a, b),
    }
}

pub(crate) fn eq_generic(a: &Key, b: &Key) -> bool {
    match (a, b) {
        (Key::Null, Key::Null) => true,
        (Key::Int(a), Key::Int(b)) => a == b,
        (Key::Str(a), Key::Str(b)) => Arc::ptr_eq(a, b) || a == b,
        (Key::Float(a), Key::Float(b)) => canonical_float_bits(*a) == canonical_float_bits(*b),
        (a @ Key::Tuple(_), b @ Key::Tuple(_)) => eq_tuple(a, b),
        (Key::Obj(a), Key::Obj(b)) => Arc::ptr_eq(a, b) || a.eq_key(&**b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_to_31_bits() {
        for key in [
            Key::from(-1i64),
            Key::from(i64::MIN),
            Key::from("x"),
            Key::from(f64::NAN),
            Key::from(vec![Key::from(1), Key::from("y")]),
            Key::identity(0u8),
            Key::Null,
        ] {
            assert_eq!(hash_generic(&key) & !HASH_MASK, 0);
        }
    }

    #[test]
    fn specialized_pairs_agree_with_generic() {
        let keys = [
            Key::from(42i64),
            Key::from("hello"),
            Key::from(2.5f64),
            Key::from(vec![Key::from(1), Key::from(2)]),
            Key::identity("obj"),
        ];
        for key in &keys {
            let (hash, eq) = ops_for(key.kind());
            assert_eq!(hash(key), hash_generic(key));
            assert!(eq(key, &key.clone()));
        }
    }

    #[test]
    fn specialized_pairs_fall_back_on_foreign_kinds() {
        let (hash, eq) = ops_for(Key::from(1i64).kind());
        let s = Key::from("not an int");
        assert_eq!(hash(&s), hash_generic(&s));
        assert!(eq(&s, &s.clone()));
        assert!(!eq(&s, &Key::from(1i64)));
    }

    #[test]
    fn float_keys_canonicalize() {
        assert_eq!(Key::from(-0.0f64), Key::from(0.0f64));
        assert_eq!(hash_generic(&Key::from(-0.0f64)), hash_generic(&Key::from(0.0f64)));
        assert_eq!(Key::from(f64::NAN), Key::from(f64::NAN));
        assert_eq!(
            hash_generic(&Key::from(f64::NAN)),
            hash_generic(&Key::from(-f64::NAN)),
        );
    }

    #[test]
    fn kinds_are_distinct_keys() {
        assert_ne!(Key::from(1i64), Key::from(1.0f64));
        assert_ne!(Key::from("1"), Key::from(1i64));
        assert_ne!(Key::Null, Key::from(0i64));
    }

    #[test]
    fn tuple_equality_is_elementwise() {
        let a = Key::from(vec![Key::from(1), Key::from("x")]);
        let b = Key::from(vec![Key::from(1), Key::from("x")]);
        let c = Key::from(vec![Key::from(1)]);
        assert_eq!(a, b);
        assert_eq!(hash_generic(&a), hash_generic(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn object_kind_tracks_concrete_type() {
        let a = Key::identity(1u32);
        let b = Key::identity(2u32);
        let c = Key::identity("str");
        assert_eq!(a.kind(), b.kind());
        assert_ne!(a.kind(), c.kind());
        assert_ne!(a, b);
    }

    #[test]
    fn identity_key_round_trips_itself() {
        let key = Key::identity(7i32);
        assert_eq!(key, key.clone());
        let other = Key::identity(7i32);
        assert_ne!(key, other);
    }
}
