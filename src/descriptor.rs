use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Field type as written in a descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FieldType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    pub(crate) fn parse(descriptor: &str) -> Result<FieldType> {
        let (field_type, rest) = parse_one(descriptor)
            .with_context(|| format!("parse field descriptor {descriptor:?}"))?;
        if !rest.is_empty() {
            anyhow::bail!("trailing characters in field descriptor {descriptor:?}");
        }
        Ok(field_type)
    }

    /// Local variable and operand stack slots taken by a value of this type.
    pub(crate) fn size(&self) -> usize {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    pub(crate) fn dimensions(&self) -> usize {
        match self {
            FieldType::Array(element) => 1 + element.dimensions(),
            _ => 0,
        }
    }

    pub(crate) fn element_type(&self) -> &FieldType {
        match self {
            FieldType::Array(element) => element.element_type(),
            other => other,
        }
    }

    /// Values of these types live on the stack as `int`.
    pub(crate) fn is_int_like(&self) -> bool {
        matches!(
            self,
            FieldType::Boolean
                | FieldType::Byte
                | FieldType::Char
                | FieldType::Short
                | FieldType::Int
        )
    }

    /// Java keyword for primitive types.
    pub(crate) fn keyword(&self) -> Option<&'static str> {
        let keyword = match self {
            FieldType::Boolean => "boolean",
            FieldType::Byte => "byte",
            FieldType::Char => "char",
            FieldType::Short => "short",
            FieldType::Int => "int",
            FieldType::Long => "long",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Object(_) | FieldType::Array(_) => return None,
        };
        Some(keyword)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Boolean => f.write_str("Z"),
            FieldType::Byte => f.write_str("B"),
            FieldType::Char => f.write_str("C"),
            FieldType::Short => f.write_str("S"),
            FieldType::Int => f.write_str("I"),
            FieldType::Long => f.write_str("J"),
            FieldType::Float => f.write_str("F"),
            FieldType::Double => f.write_str("D"),
            FieldType::Object(name) => write!(f, "L{name};"),
            FieldType::Array(element) => write!(f, "[{element}"),
        }
    }
}

/// Parsed method descriptor; `return_type` is `None` for `void`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MethodType {
    pub(crate) arguments: Vec<FieldType>,
    pub(crate) return_type: Option<FieldType>,
}

impl MethodType {
    pub(crate) fn parse(descriptor: &str) -> Result<MethodType> {
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
        let inner = descriptor
            .strip_prefix('(')
            .context("method descriptor must start with '('")?;
        let (mut rest, mut arguments) = (inner, Vec::new());
        while !rest.starts_with(')') {
            let (argument, tail) = parse_one(rest)
                .with_context(|| format!("parse method descriptor {descriptor:?}"))?;
            arguments.push(argument);
            rest = tail;
        }
        let rest = &rest[1..];
        let return_type = if rest == "V" {
            None
        } else {
            Some(FieldType::parse(rest)?)
        };
        Ok(MethodType {
            arguments,
            return_type,
        })
    }

    /// Slots taken by the arguments, excluding `this`.
    pub(crate) fn argument_size(&self) -> usize {
        self.arguments.iter().map(FieldType::size).sum()
    }

    pub(crate) fn return_size(&self) -> usize {
        self.return_type.as_ref().map_or(0, FieldType::size)
    }

    pub(crate) fn without_argument(&self, index: usize) -> MethodType {
        let mut arguments = self.arguments.clone();
        if index < arguments.len() {
            arguments.remove(index);
        }
        MethodType {
            arguments,
            return_type: self.return_type.clone(),
        }
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for argument in &self.arguments {
            write!(f, "{argument}")?;
        }
        f.write_str(")")?;
        match &self.return_type {
            Some(return_type) => write!(f, "{return_type}"),
            None => f.write_str("V"),
        }
    }
}

/// Slot size of a field descriptor.
pub(crate) fn field_size(descriptor: &str) -> Result<usize> {
    Ok(FieldType::parse(descriptor)?.size())
}

fn parse_one(input: &str) -> Result<(FieldType, &str)> {
    let mut chars = input.chars();
    let head = chars.next().context("unexpected end of descriptor")?;
    let rest = chars.as_str();
    let field_type = match head {
        'Z' => FieldType::Boolean,
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'S' => FieldType::Short,
        'I' => FieldType::Int,
        'J' => FieldType::Long,
        'F' => FieldType::Float,
        'D' => FieldType::Double,
        'L' => {
            let end = rest.find(';').context("unterminated class descriptor")?;
            if end == 0 {
                anyhow::bail!("empty class name in descriptor");
            }
            return Ok((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]));
        }
        '[' => {
            let (element, tail) = parse_one(rest)?;
            return Ok((FieldType::Array(Box::new(element)), tail));
        }
        other => anyhow::bail!("unexpected descriptor character {other:?}"),
    };
    Ok((field_type, rest))
}
