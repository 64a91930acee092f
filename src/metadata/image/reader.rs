//! Image parsing, the inverse of [`super::writer`].
//!
//! Flags are read with `from_bits_retain` so that bits this crate does not name survive a
//! load and write cycle unchanged.

use std::collections::HashSet;

use uguid::Guid;

use crate::{
    assembly::decode_body,
    file::parser::Parser,
    metadata::{
        image::{
            writer::{IMAGE_MAGIC, IMAGE_VERSION},
            AssemblyImage, FieldAttributes, FieldDefinition, MemberReference, TypeAttributes,
            TypeDefinition,
        },
        method::{MethodAttributes, MethodBody, MethodDefinition},
        token::{TableId, Token},
        typesystem::TypeDescriptor,
    },
    Result,
};

/// Upper bound for any count field, rejects garbage before allocating for it
const MAX_ENTRIES: usize = 0x00FF_FFFF;

struct ImageReader<'a> {
    parser: Parser<'a>,
    seen: HashSet<Token>,
}

pub(crate) fn read_image(data: &[u8]) -> Result<AssemblyImage> {
    let mut reader = ImageReader {
        parser: Parser::new(data),
        seen: HashSet::new(),
    };

    let magic = reader.parser.read_bytes(IMAGE_MAGIC.len())?;
    if magic != IMAGE_MAGIC {
        return Err(malformed_error!("Invalid image magic - {:02x?}", magic));
    }
    let version = reader.parser.read_le::<u16>()?;
    if version != IMAGE_VERSION {
        return Err(malformed_error!("Unsupported image version - {}", version));
    }

    let mvid_bytes: [u8; 16] = reader
        .parser
        .read_bytes(16)?
        .try_into()
        .map_err(|_| out_of_bounds_error!())?;
    let mvid = Guid::from_bytes(mvid_bytes);
    let name = reader.parser.read_prefixed_string_utf8()?;

    let ref_count = reader.count()?;
    let mut member_refs = Vec::with_capacity(ref_count);
    for _ in 0..ref_count {
        member_refs.push(reader.member_ref()?);
    }

    let type_count = reader.count()?;
    let mut types = Vec::with_capacity(type_count);
    for _ in 0..type_count {
        types.push(reader.type_def()?);
    }

    if reader.parser.has_more_data() {
        return Err(malformed_error!(
            "Trailing data after image at offset {}",
            reader.parser.pos()
        ));
    }

    Ok(AssemblyImage::from_parts(name, mvid, member_refs, types))
}

impl ImageReader<'_> {
    fn count(&mut self) -> Result<usize> {
        let count = self.parser.read_compressed_uint()? as usize;
        if count > MAX_ENTRIES || count > self.parser.len() {
            return Err(malformed_error!("Implausible entry count - {}", count));
        }
        Ok(count)
    }

    fn token(&mut self, table: TableId) -> Result<Token> {
        let row = self.parser.read_compressed_uint()?;
        if row == 0 || row > 0x00FF_FFFF {
            return Err(malformed_error!("Invalid {} row - {}", table, row));
        }

        let token = Token::from_parts(table, row);
        if !self.seen.insert(token) {
            return Err(malformed_error!("Duplicate {} row - {}", table, row));
        }
        Ok(token)
    }

    fn params(&mut self) -> Result<Vec<TypeDescriptor>> {
        let count = self.count()?;
        let mut params = Vec::with_capacity(count);
        for _ in 0..count {
            params.push(TypeDescriptor::decode(&mut self.parser)?);
        }
        Ok(params)
    }

    fn flag(&mut self) -> Result<bool> {
        match self.parser.read_le::<u8>()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(malformed_error!("Invalid flag byte - {}", other)),
        }
    }

    fn member_ref(&mut self) -> Result<MemberReference> {
        let token = self.token(TableId::MemberRef)?;
        let type_name = self.parser.read_prefixed_string_utf8()?;
        let name = self.parser.read_prefixed_string_utf8()?;
        let has_this = self.flag()?;
        let params = self.params()?;
        let returns = TypeDescriptor::decode_return(&mut self.parser)?;

        Ok(MemberReference {
            token,
            type_name,
            name,
            has_this,
            params,
            returns,
        })
    }

    fn type_def(&mut self) -> Result<TypeDefinition> {
        let token = self.token(TableId::TypeDef)?;
        let namespace = self.parser.read_prefixed_string_utf8()?;
        let name = self.parser.read_prefixed_string_utf8()?;
        let flags = TypeAttributes::from_bits_retain(self.parser.read_le::<u32>()?);

        let field_count = self.count()?;
        let mut fields: Vec<FieldDefinition> = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let field = self.field()?;
            if fields.iter().any(|existing| existing.name == field.name) {
                return Err(malformed_error!(
                    "Field {} declared twice on {}",
                    field.name,
                    name
                ));
            }
            fields.push(field);
        }

        let method_count = self.count()?;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            methods.push(self.method()?);
        }

        Ok(TypeDefinition {
            token,
            namespace,
            name,
            flags,
            fields,
            methods,
        })
    }

    fn field(&mut self) -> Result<FieldDefinition> {
        let token = self.token(TableId::Field)?;
        let name = self.parser.read_prefixed_string_utf8()?;
        let flags = FieldAttributes::from_bits_retain(self.parser.read_le::<u16>()?);
        let field_type = TypeDescriptor::decode(&mut self.parser)?;
        let offset = if self.flag()? {
            Some(self.parser.read_le::<u32>()?)
        } else {
            None
        };

        Ok(FieldDefinition {
            token,
            name,
            field_type,
            flags,
            offset,
        })
    }

    fn method(&mut self) -> Result<MethodDefinition> {
        let token = self.token(TableId::MethodDef)?;
        let name = self.parser.read_prefixed_string_utf8()?;
        let flags = MethodAttributes::from_bits_retain(self.parser.read_le::<u16>()?);
        let params = self.params()?;
        let returns = TypeDescriptor::decode_return(&mut self.parser)?;

        let body = if self.flag()? {
            let max_stack = self.parser.read_le::<u16>()?;
            let locals = self.params()?;
            let code_size = self.parser.read_le::<u32>()? as usize;
            let code = decode_body(self.parser.read_bytes(code_size)?)?;
            Some(MethodBody::new(max_stack, locals, code))
        } else {
            None
        };

        Ok(MethodDefinition {
            token,
            name,
            flags,
            params,
            returns,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assembly::{Instruction, InstructionSequence},
        metadata::{
            image::{AssemblyImage, FieldAttributes, FieldDefinition, TypeAttributes},
            method::{MethodAttributes, MethodBody, MethodDefinition},
            token::{TableId, Token},
            typesystem::TypeDescriptor,
        },
        Error,
    };
    use uguid::guid;

    fn sample() -> AssemblyImage {
        let mut image = AssemblyImage::new("Sample", guid!("8d0b9c4e-4a4b-4c2f-9a07-3e1d5b6a7c80"));
        image.add_type("Game", "Counter", TypeAttributes::PUBLIC).unwrap();
        image.add_member_ref("Log", "Write", false, vec![TypeDescriptor::int32()], None);

        let mut code = InstructionSequence::new();
        let done = code.new_label();
        code.push(Instruction::ldarg(0).unwrap());
        code.push(Instruction::branch("brfalse.s", done).unwrap());
        code.push(Instruction::ldc_i4(7).unwrap());
        code.push(Instruction::simple("ret").unwrap());
        code.mark_label(done, 4).unwrap();
        code.push(Instruction::ldc_i4(1000).unwrap());
        code.push(Instruction::simple("ret").unwrap());

        image
            .add_method(
                "Game.Counter",
                MethodDefinition {
                    token: Token::new(0),
                    name: "Pick".to_string(),
                    flags: MethodAttributes::PUBLIC | MethodAttributes::STATIC,
                    params: vec![TypeDescriptor::boolean()],
                    returns: Some(TypeDescriptor::int32()),
                    body: Some(MethodBody::new(1, vec![], code)),
                },
            )
            .unwrap();

        let counter = image.find_type_mut("Game.Counter").unwrap();
        counter.fields.push(FieldDefinition {
            token: Token::from_parts(TableId::Field, 1),
            name: "value".to_string(),
            field_type: TypeDescriptor::int32(),
            flags: FieldAttributes::PRIVATE,
            offset: None,
        });
        image
    }

    #[test]
    fn load_write_is_identical() {
        let bytes = sample().to_bytes().unwrap();
        let image = AssemblyImage::from_mem(&bytes).unwrap();

        assert_eq!(image, sample());
        assert_eq!(image.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn unknown_flag_bits_survive() {
        let mut image = sample();
        image.find_type_mut("Game.Counter").unwrap().flags = TypeAttributes::from_bits_retain(0x0010_0001);
        let bytes = image.to_bytes().unwrap();

        let reloaded = AssemblyImage::from_mem(&bytes).unwrap();
        assert_eq!(
            reloaded.find_type("Game.Counter").unwrap().flags.bits(),
            0x0010_0001
        );
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let mut bytes = sample().to_bytes().unwrap();
        assert!(matches!(
            AssemblyImage::from_mem(&bytes[..bytes.len() - 3]),
            Err(Error::OutOfBounds { .. })
        ));

        bytes.push(0);
        assert!(matches!(
            AssemblyImage::from_mem(&bytes),
            Err(Error::Malformed { .. })
        ));

        bytes[0] = b'X';
        assert!(matches!(
            AssemblyImage::from_mem(&bytes),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(AssemblyImage::from_mem(&[]), Err(Error::Empty)));
    }

    #[test]
    fn rejects_duplicate_rows() {
        let mut image = sample();
        let counter = image.find_type_mut("Game.Counter").unwrap();
        counter.fields.push(FieldDefinition {
            token: Token::from_parts(TableId::Field, 1),
            name: "other".to_string(),
            field_type: TypeDescriptor::int32(),
            flags: FieldAttributes::PRIVATE,
            offset: None,
        });

        let bytes = image.to_bytes().unwrap();
        assert!(matches!(
            AssemblyImage::from_mem(&bytes),
            Err(Error::Malformed { .. })
        ));
    }
}
