//! Adding fields to existing types.

use log::debug;

use crate::{
    metadata::{
        image::{AssemblyImage, FieldAttributes, FieldDefinition, TypeLayout},
        token::{TableId, Token},
        typesystem::TypeDescriptor,
    },
    Error, Result,
};

/// Append a public field to the type called `type_name`.
///
/// The field takes the next free `Field` row, so no existing token changes and the
/// type's other fields keep their order. Only the in-memory image is modified.
///
/// `explicit_offset` is recorded as given; it is accepted only on types with
/// sequential or explicit layout, and overlap with existing fields is not checked.
///
/// # Errors
///
/// - [`Error::TypeNotFound`] if no type has that name
/// - [`Error::FieldNameCollision`] if the type already declares `field_name`; the image
///   is left unchanged
/// - [`Error::LayoutMismatch`] if an offset is given for an auto-layout type
///
/// # Examples
///
/// ```rust
/// use cilsplice::{
///     metadata::{image::{AssemblyImage, TypeAttributes}, typesystem::TypeDescriptor},
///     patch::inject_field,
///     Error,
/// };
/// use uguid::guid;
///
/// let mut image = AssemblyImage::new("Host", guid!("00000000-0000-0000-0000-000000000001"));
/// image.add_type("Game", "Player", TypeAttributes::PUBLIC)?;
///
/// let field = inject_field(&mut image, "Game.Player", "shield", TypeDescriptor::int32(), false, None)?;
/// assert_eq!(field.token.row(), 1);
///
/// let again = inject_field(&mut image, "Game.Player", "shield", TypeDescriptor::int32(), false, None);
/// assert!(matches!(again, Err(Error::FieldNameCollision { .. })));
/// # Ok::<(), cilsplice::Error>(())
/// ```
pub fn inject_field(
    image: &mut AssemblyImage,
    type_name: &str,
    field_name: &str,
    field_type: TypeDescriptor,
    is_static: bool,
    explicit_offset: Option<u32>,
) -> Result<FieldDefinition> {
    let row = image.next_row(TableId::Field);
    let ty = image
        .find_type_mut(type_name)
        .ok_or_else(|| Error::TypeNotFound(type_name.to_string()))?;

    if let Some(existing) = ty.field(field_name) {
        return Err(Error::FieldNameCollision {
            type_name: type_name.to_string(),
            field: field_name.to_string(),
            existing: existing.token,
        });
    }
    if explicit_offset.is_some() && ty.flags.layout() == TypeLayout::Auto {
        return Err(Error::LayoutMismatch(type_name.to_string()));
    }

    let mut flags = FieldAttributes::PUBLIC;
    if is_static {
        flags |= FieldAttributes::STATIC;
    }
    let field = FieldDefinition {
        token: Token::from_parts(TableId::Field, row),
        name: field_name.to_string(),
        field_type,
        flags,
        offset: explicit_offset,
    };

    debug!("Injected {} {}.{} as {}", field.field_type, type_name, field_name, field.token);
    ty.fields.push(field.clone());
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::image::TypeAttributes;
    use uguid::guid;

    fn image() -> AssemblyImage {
        let mut image = AssemblyImage::new("Host", guid!("00000000-0000-0000-0000-0000000000ee"));
        image.add_type("Game", "Player", TypeAttributes::PUBLIC).unwrap();
        image
            .add_type("Game", "Packed", TypeAttributes::PUBLIC | TypeAttributes::EXPLICIT_LAYOUT)
            .unwrap();
        image
    }

    #[test]
    fn appends_in_order_with_fresh_rows() {
        let mut image = image();
        let a = inject_field(&mut image, "Game.Player", "a", TypeDescriptor::int32(), false, None).unwrap();
        let b = inject_field(&mut image, "Game.Packed", "b", TypeDescriptor::boolean(), true, Some(8)).unwrap();

        assert_eq!(a.token, Token::new(0x0400_0001));
        assert_eq!(b.token, Token::new(0x0400_0002));
        assert!(b.is_static());
        assert_eq!(image.find_type("Game.Packed").unwrap().fields[0].offset, Some(8));
    }

    #[test]
    fn collision_adds_nothing() {
        let mut image = image();
        let first = inject_field(&mut image, "Game.Player", "hp", TypeDescriptor::int32(), false, None).unwrap();
        let err = inject_field(&mut image, "Game.Player", "hp", TypeDescriptor::int32(), false, None).unwrap_err();

        match err {
            Error::FieldNameCollision { existing, .. } => assert_eq!(existing, first.token),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(image.find_type("Game.Player").unwrap().fields.len(), 1);
    }

    #[test]
    fn resolution_failures() {
        let mut image = image();
        assert!(matches!(
            inject_field(&mut image, "Game.Missing", "x", TypeDescriptor::int32(), false, None),
            Err(Error::TypeNotFound(_))
        ));
        assert!(matches!(
            inject_field(&mut image, "Game.Player", "x", TypeDescriptor::int32(), false, Some(4)),
            Err(Error::LayoutMismatch(_))
        ));
        assert!(image.find_type("Game.Player").unwrap().fields.is_empty());
    }
}
