use crate::error::{DbError, Result};
use crate::page::BTreePageId;

const INT_BYTES: usize = 4;

/// The type of a single field in a record.
///
/// Varchar fields are fixed-width on disk: a 4 byte length followed by
/// `n` bytes of payload, zero padded. Every slot in a page has the same
/// size, so variable-length storage is not an option here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Varchar(usize),
}

impl FieldType {
    /// The number of bytes a value of this type occupies inside a record slot.
    pub fn byte_size(&self) -> usize {
        match self {
            FieldType::Int => INT_BYTES,
            FieldType::Varchar(n) => INT_BYTES + n,
        }
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Int(i32),
    Varchar(String),
}

impl Value {
    /// Serialize this value into `buf`, which must be exactly
    /// `ty.byte_size()` bytes long.
    pub fn write_to(&self, buf: &mut [u8], ty: FieldType) -> Result<()> {
        debug_assert_eq!(buf.len(), ty.byte_size());
        match (self, ty) {
            (Value::Int(v), FieldType::Int) => {
                buf.copy_from_slice(&v.to_be_bytes());
                Ok(())
            }
            (Value::Varchar(s), FieldType::Varchar(n)) => {
                let bytes = s.as_bytes();
                if bytes.len() > n {
                    return Err(DbError::invalid(format!(
                        "string of length {} does not fit in varchar({})",
                        bytes.len(),
                        n
                    )));
                }
                buf[..INT_BYTES].copy_from_slice(&(bytes.len() as i32).to_be_bytes());
                buf[INT_BYTES..INT_BYTES + bytes.len()].copy_from_slice(bytes);
                buf[INT_BYTES + bytes.len()..].fill(0);
                Ok(())
            }
            (value, ty) => Err(DbError::invalid(format!(
                "type mismatch: expected {ty:?} but got {value:?}"
            ))),
        }
    }

    /// Deserialize a value of type `ty` from `buf`.
    pub fn read_from(buf: &[u8], ty: FieldType) -> Result<Value> {
        debug_assert_eq!(buf.len(), ty.byte_size());
        match ty {
            FieldType::Int => {
                let bytes: [u8; INT_BYTES] = buf[..INT_BYTES].try_into().unwrap();
                Ok(Value::Int(i32::from_be_bytes(bytes)))
            }
            FieldType::Varchar(n) => {
                let bytes: [u8; INT_BYTES] = buf[..INT_BYTES].try_into().unwrap();
                let len = i32::from_be_bytes(bytes) as usize;
                if len > n {
                    return Err(DbError::invalid(format!(
                        "varchar length {len} exceeds declared width {n}"
                    )));
                }
                let s = String::from_utf8(buf[INT_BYTES..INT_BYTES + len].to_vec())
                    .map_err(|e| DbError::invalid(format!("invalid utf-8 in varchar: {e}")))?;
                Ok(Value::Varchar(s))
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Varchar(s) => write!(f, "{s}"),
        }
    }
}

/// The physical layout of the records stored in an index file.
///
/// All records in a file share one layout, so slot sizes are fixed and a
/// record's byte offset within a page is a simple multiple of
/// [`Layout::tuple_size`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    fields: Vec<FieldType>,
    tuple_size: usize,
}

impl Layout {
    pub fn new(fields: Vec<FieldType>) -> Self {
        let tuple_size = fields.iter().map(|f| f.byte_size()).sum();
        Self { fields, tuple_size }
    }

    pub fn fields(&self) -> &[FieldType] {
        &self.fields
    }

    pub fn field_type(&self, index: usize) -> FieldType {
        self.fields[index]
    }

    /// The number of bytes one record occupies inside a page slot.
    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    /// Verify that a tuple matches this layout in arity and field types.
    pub fn check_tuple(&self, tuple: &Tuple) -> Result<()> {
        if tuple.values().len() != self.fields.len() {
            return Err(DbError::invalid(format!(
                "tuple has {} fields but the layout declares {}",
                tuple.values().len(),
                self.fields.len()
            )));
        }
        for (value, ty) in tuple.values().iter().zip(&self.fields) {
            match (value, ty) {
                (Value::Int(_), FieldType::Int) => {}
                (Value::Varchar(s), FieldType::Varchar(n)) if s.len() <= *n => {}
                _ => {
                    return Err(DbError::invalid(format!(
                        "type mismatch: expected {ty:?} but got {value:?}"
                    )))
                }
            }
        }
        Ok(())
    }
}

/// The stored location of a record: the page it lives on and the slot
/// within that page. A record that is not stored anywhere has no record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub page_id: BTreePageId,
    pub slot: usize,
}

impl RecordId {
    pub fn new(page_id: BTreePageId, slot: usize) -> Self {
        Self { page_id, slot }
    }
}

/// A record, together with its storage back-pointer once it has been
/// placed on a leaf page.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    values: Vec<Value>,
    record_id: Option<RecordId>,
}

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            record_id: None,
        }
    }

    pub fn value(&self, index: usize) -> &Value {
        &self.values[index]
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub fn set_record_id(&mut self, rid: Option<RecordId>) {
        self.record_id = rid;
    }

    /// Serialize this tuple into `buf`, which must be `layout.tuple_size()`
    /// bytes long.
    pub fn write_to(&self, buf: &mut [u8], layout: &Layout) -> Result<()> {
        debug_assert_eq!(buf.len(), layout.tuple_size());
        let mut offset = 0;
        for (value, &ty) in self.values.iter().zip(layout.fields()) {
            value.write_to(&mut buf[offset..offset + ty.byte_size()], ty)?;
            offset += ty.byte_size();
        }
        Ok(())
    }

    /// Deserialize a tuple from `buf`. The record id is left unset; the
    /// caller knows where the bytes came from.
    pub fn read_from(buf: &[u8], layout: &Layout) -> Result<Tuple> {
        debug_assert_eq!(buf.len(), layout.tuple_size());
        let mut values = Vec::with_capacity(layout.fields().len());
        let mut offset = 0;
        for &ty in layout.fields() {
            values.push(Value::read_from(&buf[offset..offset + ty.byte_size()], ty)?);
            offset += ty.byte_size();
        }
        Ok(Tuple::new(values))
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        write!(f, "(")?;
        for value in &self.values {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
            first = false;
        }
        write!(f, ")")
    }
}
