use std::fs;
use std::io::Read;

use arbor_hash::ObjectId;
use arbor_object::Object;
use flate2::read::ZlibDecoder;

use crate::{ObjectStore, OdbError};

impl ObjectStore {
    /// Read an object by OID.
    ///
    /// Returns `Ok(None)` if the object does not exist, `Err` if it exists
    /// but is corrupt.
    pub fn read(&self, oid: &ObjectId) -> Result<Option<Object>, OdbError> {
        let path = self.object_path(oid);
        let compressed = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(OdbError::Io(e)),
        };

        let decompressed = decompress_all(&compressed, oid)?;
        let obj = Object::parse(&decompressed)?;
        Ok(Some(obj))
    }

    /// Read a blob's bytes by OID.
    ///
    /// Errors with [`OdbError::NotFound`] when the object is missing and
    /// [`OdbError::UnexpectedObjectType`] when it is not a blob.
    pub fn read_blob(&self, oid: &ObjectId) -> Result<Vec<u8>, OdbError> {
        match self.read(oid)? {
            None => Err(OdbError::NotFound(*oid)),
            Some(Object::Blob(b)) => Ok(b.data),
            Some(other) => Err(OdbError::UnexpectedObjectType {
                oid: *oid,
                expected: "blob",
                actual: other.object_type().to_string(),
            }),
        }
    }

    /// Read a tree by OID.
    pub fn read_tree(&self, oid: &ObjectId) -> Result<arbor_object::Tree, OdbError> {
        match self.read(oid)? {
            None => Err(OdbError::NotFound(*oid)),
            Some(Object::Tree(t)) => Ok(t),
            Some(other) => Err(OdbError::UnexpectedObjectType {
                oid: *oid,
                expected: "tree",
                actual: other.object_type().to_string(),
            }),
        }
    }
}

/// Zlib-decompress the full contents of an object file.
fn decompress_all(compressed: &[u8], oid: &ObjectId) -> Result<Vec<u8>, OdbError> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| OdbError::Decompress {
            oid: oid.to_hex(),
            source: e,
        })?;
    Ok(decompressed)
}
