//! Image serialization.
//!
//! Layout, all integers little-endian, counts and rows as compressed integers:
//!
//! ```text
//! header      "CILS" u16:version guid:mvid str:name
//! member refs count { row str:type str:name u8:has_this count {type} ret }
//! types       count { row str:namespace str:name u32:flags
//!                     count { row str:name u16:flags type u8:has_offset [u32:offset] }
//!                     count { row str:name u16:flags count {type} ret u8:has_body
//!                             [u16:max_stack count {type} u32:code_size code] } }
//! ```

use crate::{
    assembly::encode_body,
    file::io::ByteWriter,
    metadata::{
        image::{AssemblyImage, FieldDefinition, MemberReference, TypeDefinition},
        method::{MethodBody, MethodDefinition},
        typesystem::TypeDescriptor,
    },
    Result,
};

pub(crate) const IMAGE_MAGIC: &[u8; 4] = b"CILS";
pub(crate) const IMAGE_VERSION: u16 = 1;

pub(crate) fn write_image(image: &AssemblyImage) -> Result<Vec<u8>> {
    let mut writer = ByteWriter::new();

    writer.write_bytes(IMAGE_MAGIC);
    writer.write_le::<u16>(IMAGE_VERSION);
    writer.write_bytes(&image.mvid().to_bytes());
    writer.write_prefixed_string_utf8(image.name())?;

    write_count(&mut writer, image.member_refs().len())?;
    for member_ref in image.member_refs() {
        write_member_ref(&mut writer, member_ref)?;
    }

    write_count(&mut writer, image.types().len())?;
    for ty in image.types() {
        write_type(&mut writer, ty)?;
    }

    Ok(writer.into_inner())
}

fn write_count(writer: &mut ByteWriter, count: usize) -> Result<()> {
    let count = u32::try_from(count)
        .map_err(|_| malformed_error!("Table with {} entries is too large", count))?;
    writer.write_compressed_uint(count)
}

fn write_params(writer: &mut ByteWriter, params: &[TypeDescriptor]) -> Result<()> {
    write_count(writer, params.len())?;
    for param in params {
        param.encode(writer)?;
    }
    Ok(())
}

fn write_member_ref(writer: &mut ByteWriter, member_ref: &MemberReference) -> Result<()> {
    writer.write_compressed_uint(member_ref.token.row())?;
    writer.write_prefixed_string_utf8(&member_ref.type_name)?;
    writer.write_prefixed_string_utf8(&member_ref.name)?;
    writer.write_le::<u8>(u8::from(member_ref.has_this));
    write_params(writer, &member_ref.params)?;
    TypeDescriptor::encode_return(member_ref.returns.as_ref(), writer)
}

fn write_type(writer: &mut ByteWriter, ty: &TypeDefinition) -> Result<()> {
    writer.write_compressed_uint(ty.token.row())?;
    writer.write_prefixed_string_utf8(&ty.namespace)?;
    writer.write_prefixed_string_utf8(&ty.name)?;
    writer.write_le::<u32>(ty.flags.bits());

    write_count(writer, ty.fields.len())?;
    for field in &ty.fields {
        write_field(writer, field)?;
    }

    write_count(writer, ty.methods.len())?;
    for method in &ty.methods {
        write_method(writer, method)?;
    }
    Ok(())
}

fn write_field(writer: &mut ByteWriter, field: &FieldDefinition) -> Result<()> {
    writer.write_compressed_uint(field.token.row())?;
    writer.write_prefixed_string_utf8(&field.name)?;
    writer.write_le::<u16>(field.flags.bits());
    field.field_type.encode(writer)?;
    match field.offset {
        Some(offset) => {
            writer.write_le::<u8>(1);
            writer.write_le::<u32>(offset);
        }
        None => writer.write_le::<u8>(0),
    }
    Ok(())
}

fn write_method(writer: &mut ByteWriter, method: &MethodDefinition) -> Result<()> {
    writer.write_compressed_uint(method.token.row())?;
    writer.write_prefixed_string_utf8(&method.name)?;
    writer.write_le::<u16>(method.flags.bits());
    write_params(writer, &method.params)?;
    TypeDescriptor::encode_return(method.returns.as_ref(), writer)?;

    match &method.body {
        Some(body) => {
            writer.write_le::<u8>(1);
            write_body(writer, body)
        }
        None => {
            writer.write_le::<u8>(0);
            Ok(())
        }
    }
}

fn write_body(writer: &mut ByteWriter, body: &MethodBody) -> Result<()> {
    writer.write_le::<u16>(body.max_stack);
    write_params(writer, &body.locals)?;

    let code = encode_body(&body.code)?;
    let code_size = u32::try_from(code.len())
        .map_err(|_| malformed_error!("Method body of {} bytes is too large", code.len()))?;
    writer.write_le::<u32>(code_size);
    writer.write_bytes(&code);
    Ok(())
}
