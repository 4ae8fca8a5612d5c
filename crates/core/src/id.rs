#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// remember to `serde(rename)` everything here to avoid name conflicts with non-ID types

/// Index of a member in a tuple.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename = "MemberId")
)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Member(usize);

pub fn member(id: usize) -> Member {
    Member(id)
}

impl Member {
    pub fn member(self) -> usize {
        self.0
    }
}

/// Index of a type in a function definition context.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename = "TyId")
)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ty(usize);

pub fn ty(id: usize) -> Ty {
    Ty(id)
}

impl Ty {
    pub fn ty(self) -> usize {
        self.0
    }
}

/// Index of a local variable in a function definition context.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename = "VarId")
)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Var(usize);

pub fn var(id: usize) -> Var {
    Var(id)
}

impl Var {
    pub fn var(self) -> usize {
        self.0
    }
}
