use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Access rights of a user on a vault
///
/// A bitmask over read, write and admin. The empty mask is not a state a
/// user can be in: granting it removes the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Access(u8);

impl Access {
    pub const NONE: Access = Access(0);
    pub const READ: Access = Access(1);
    pub const WRITE: Access = Access(2);
    pub const ADMIN: Access = Access(4);
    pub const READ_WRITE: Access = Access(1 | 2);
    pub const READ_WRITE_ADMIN: Access = Access(1 | 2 | 4);

    pub fn from_bits(bits: u8) -> Self {
        Access(bits & 0b111)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn can_read(&self) -> bool {
        self.contains(Access::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Access::WRITE)
    }

    pub fn is_admin(&self) -> bool {
        self.contains(Access::ADMIN)
    }
}

impl BitOr for Access {
    type Output = Access;
    fn bitor(self, rhs: Self) -> Self::Output {
        Access(self.0 | rhs.0)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        let r = if self.can_read() { "r" } else { "-" };
        let w = if self.can_write() { "w" } else { "-" };
        let a = if self.is_admin() { "a" } else { "-" };
        write!(f, "{}{}{}", r, w, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_bits() {
        let rw = Access::READ | Access::WRITE;
        assert_eq!(rw, Access::READ_WRITE);
        assert!(rw.can_read() && rw.can_write());
        assert!(!rw.is_admin());
        assert!(Access::READ_WRITE_ADMIN.contains(rw));
        assert_eq!(Access::from_bits(0xff), Access::READ_WRITE_ADMIN);
        assert_eq!(Access::READ.to_string(), "r--");
        assert_eq!(Access::NONE.to_string(), "none");
    }
}
