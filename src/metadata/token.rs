//! Metadata tokens.
//!
//! A token is the 32-bit handle a method body uses to name a type, field, method or
//! member reference. The high byte selects the table and the low 24 bits the row.
//! Rows are stored explicitly in an [`crate::metadata::image::AssemblyImage`], so a
//! token handed out once stays valid across every later injection.

use std::fmt;

use strum::{Display, EnumIter};

/// The metadata tables a [`Token`] can point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[repr(u8)]
pub enum TableId {
    /// Type definitions
    TypeDef = 0x02,
    /// Field definitions
    Field = 0x04,
    /// Method definitions
    MethodDef = 0x06,
    /// References to members implemented outside the image
    MemberRef = 0x0A,
}

impl TableId {
    /// Map a raw table byte back to its [`TableId`].
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<TableId> {
        match byte {
            0x02 => Some(TableId::TypeDef),
            0x04 => Some(TableId::Field),
            0x06 => Some(TableId::MethodDef),
            0x0A => Some(TableId::MemberRef),
            _ => None,
        }
    }
}

/// A metadata token representing a reference to a metadata table entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Build a token from its table and row.
    ///
    /// Rows wider than 24 bits are truncated.
    #[must_use]
    pub fn from_parts(table: TableId, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The table this token points into, if it is one the image stores.
    #[must_use]
    pub fn table_id(&self) -> Option<TableId> {
        TableId::from_byte(self.table())
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the token points into `table`.
    #[must_use]
    pub fn is_table(&self, table: TableId) -> bool {
        self.table() == table as u8
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn parts_roundtrip() {
        let token = Token::from_parts(TableId::Field, 7);
        assert_eq!(token.value(), 0x0400_0007);
        assert_eq!(token.table(), 0x04);
        assert_eq!(token.row(), 7);
        assert_eq!(token.table_id(), Some(TableId::Field));
        assert!(token.is_table(TableId::Field));
        assert!(!token.is_table(TableId::MethodDef));
    }

    #[test]
    fn table_bytes() {
        for table in TableId::iter() {
            assert_eq!(TableId::from_byte(table as u8), Some(table));
        }
        assert_eq!(TableId::from_byte(0x01), None);
        assert_eq!(Token(0x7000_0001).table_id(), None);
    }

    #[test]
    fn formatting() {
        let token = Token(0x0600_0001);
        assert_eq!(format!("{token}"), "0x06000001");

        let debug_str = format!("{token:?}");
        assert!(debug_str.contains("table: 0x06"));
        assert!(debug_str.contains("row: 1"));
    }

    #[test]
    fn null_and_ordering() {
        assert!(Token(0).is_null());
        assert!(!Token(0x0200_0001).is_null());
        assert!(Token(0x0600_0001) < Token(0x0600_0002));
        assert!(Token(0x0600_FFFF) < Token(0x0A00_0001));
    }
}
