use {crate::Version, std::fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Check,
    Create,
    Set,
    Erase,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Check => f.write_str("check"),
            Self::Create => f.write_str("create"),
            Self::Set => f.write_str("set"),
            Self::Erase => f.write_str("erase"),
        }
    }
}

///
/// One sub-operation of a [`Transaction`].
///
/// A `version` of `0` in [`TxnOp::Check`] and [`TxnOp::Erase`] accepts any version, the key must
/// still exist.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Check {
        key: String,
        version: Version,
    },
    Create {
        key: String,
        value: Vec<u8>,
        leased: bool,
    },
    Set {
        key: String,
        value: Vec<u8>,
    },
    Erase {
        key: String,
        version: Version,
    },
}

impl TxnOp {
    pub fn check(key: impl Into<String>, version: Version) -> Self {
        Self::Check {
            key: key.into(),
            version,
        }
    }

    pub fn create(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Create {
            key: key.into(),
            value: value.into(),
            leased: false,
        }
    }

    pub fn create_leased(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Create {
            key: key.into(),
            value: value.into(),
            leased: true,
        }
    }

    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn erase(key: impl Into<String>, version: Version) -> Self {
        Self::Erase {
            key: key.into(),
            version,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Self::Check { .. } => OpKind::Check,
            Self::Create { .. } => OpKind::Create,
            Self::Set { .. } => OpKind::Set,
            Self::Erase { .. } => OpKind::Erase,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Check { key, .. }
            | Self::Create { key, .. }
            | Self::Set { key, .. }
            | Self::Erase { key, .. } => key,
        }
    }
}

///
/// Ordered list of sub-operations committed atomically by the backend.
///
/// Examples
///
/// ```
/// use rust_coordkv::{OpKind, Transaction};
///
/// let txn = Transaction::new().check("/d", 42).set("/e", "x");
///
/// let kinds: Vec<OpKind> = txn.iter().map(|op| op.kind()).collect();
/// assert_eq!(kinds, vec![OpKind::Check, OpKind::Set]);
/// ```
///
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<TxnOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(self, key: impl Into<String>, version: Version) -> Self {
        self.push(TxnOp::check(key, version))
    }

    pub fn create(self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.push(TxnOp::create(key, value))
    }

    pub fn create_leased(self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.push(TxnOp::create_leased(key, value))
    }

    pub fn set(self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.push(TxnOp::set(key, value))
    }

    pub fn erase(self, key: impl Into<String>, version: Version) -> Self {
        self.push(TxnOp::erase(key, version))
    }

    pub fn push(mut self, op: TxnOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TxnOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl From<Vec<TxnOp>> for Transaction {
    fn from(ops: Vec<TxnOp>) -> Self {
        Self { ops }
    }
}

impl FromIterator<TxnOp> for Transaction {
    fn from_iter<I: IntoIterator<Item = TxnOp>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Transaction {
    type Item = TxnOp;
    type IntoIter = std::vec::IntoIter<TxnOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

impl<'a> IntoIterator for &'a Transaction {
    type Item = &'a TxnOp;
    type IntoIter = std::slice::Iter<'a, TxnOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}
