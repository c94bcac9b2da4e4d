//! File lifecycle: Open, Close, Create, Stat.

use tracing::info;

use xtrieve_common::constants::{is_valid_page_size, MAX_KEYS, PAGE_HEADER_SIZE};
use xtrieve_common::types::{KeyChain, KeyDescriptor, KeyFlags, KeyType, SessionId};
use xtrieve_common::{StatusCode, XtrieveResult};
use xtrieve_storage::btree::node::leaf_capacity;
use xtrieve_storage::page::slotted::{cell_size, SLOT_SIZE};
use xtrieve_storage::page::FileControlRecord;

use crate::dispatcher::{Engine, Request, Response};
use crate::files::OpenMode;
use crate::position::{PositionBlock, MAX_CURSOR_KEY};

/// Fixed prefix of the create payload and the stat reply.
const SPEC_HEADER_SIZE: usize = 10;
/// One key descriptor entry in either payload.
const SPEC_ENTRY_SIZE: usize = 16;

impl Engine {
    pub(crate) fn op_open(&self, session: SessionId, request: &Request) -> XtrieveResult<Response> {
        if request.file_path.is_empty() {
            return Err(StatusCode::FileNotFound.into());
        }
        let mode = OpenMode::from_wire(request.key_number)
            .ok_or(xtrieve_common::XtrieveError::Status(StatusCode::InvalidOperation))?;

        let path = std::path::Path::new(&request.file_path);
        let handle = self.files.open(path, mode, session)?;

        let exclusive = mode == OpenMode::Exclusive;
        if let Err(e) = self
            .locks
            .open_file(handle.descriptor.file_id, session, exclusive)
        {
            let _ = self.files.close(&handle);
            return Err(e);
        }

        let block = PositionBlock::fresh(handle.id, handle.generation);
        Ok(Response::status_only(StatusCode::Success, block.encode()))
    }

    pub(crate) fn op_close(&self, session: SessionId, request: &Request) -> XtrieveResult<Response> {
        let (handle, _) = self.resolve_block(session, request)?;
        let file_id = handle.descriptor.file_id;

        // Closing a file that is inside the session's transaction aborts
        // the whole transaction first.
        if self.txns.abort_if_involves(session, file_id)? {
            self.locks.release_records(session);
        }

        let (_, last) = self.files.close(&handle)?;
        self.locks.close_file(file_id, session);
        if last {
            self.locks.forget_file(file_id);
        }

        Ok(Response::status_only(StatusCode::Success, vec![0u8; 128]))
    }

    pub(crate) fn op_create(&self, _session: SessionId, request: &Request) -> XtrieveResult<Response> {
        if request.file_path.is_empty() {
            return Err(StatusCode::FileNotFound.into());
        }

        let fcr = parse_creation_spec(&request.data)?;
        info!(
            path = %request.file_path,
            record_length = fcr.record_length,
            page_size = fcr.page_size,
            keys = fcr.keys.len(),
            "create file"
        );
        self.files
            .create_file(std::path::Path::new(&request.file_path), fcr)?;

        Ok(Response::status_only(StatusCode::Success, request.position_block.clone()))
    }

    pub(crate) fn op_stat(&self, session: SessionId, request: &Request) -> XtrieveResult<Response> {
        let (handle, _) = self.resolve_block(session, request)?;
        let fcr = handle.descriptor.store.fcr();

        let mut data = Vec::with_capacity(SPEC_HEADER_SIZE + fcr.entry_count() * SPEC_ENTRY_SIZE + 8);
        data.extend_from_slice(&fcr.record_length.to_le_bytes());
        data.extend_from_slice(&fcr.page_size.to_le_bytes());
        data.extend_from_slice(&(fcr.entry_count() as u16).to_le_bytes());
        data.extend_from_slice(&[0u8; 4]);

        for chain in &fcr.keys {
            for segment in chain.segments() {
                data.extend_from_slice(&segment.position.to_le_bytes());
                data.extend_from_slice(&segment.length.to_le_bytes());
                data.extend_from_slice(&segment.flags.bits().to_le_bytes());
                data.push(segment.key_type as u8);
                data.push(segment.null_value);
                data.extend_from_slice(&[0u8; 8]);
            }
        }

        data.extend_from_slice(&fcr.record_count.to_le_bytes());
        data.extend_from_slice(&fcr.page_count.to_le_bytes());

        Ok(Response {
            status: StatusCode::Success,
            position_block: request.position_block.clone(),
            data,
            key: Vec::new(),
        })
    }
}

/// Parses and validates the Create payload into a fresh FCR.
fn parse_creation_spec(data: &[u8]) -> XtrieveResult<FileControlRecord> {
    if data.len() < SPEC_HEADER_SIZE {
        return Err(StatusCode::DataBufferTooShort.into());
    }

    let record_length = u16::from_le_bytes(data[0..2].try_into().unwrap());
    let page_size = u16::from_le_bytes(data[2..4].try_into().unwrap());
    let num_keys = u16::from_le_bytes(data[4..6].try_into().unwrap()) as usize;

    if !is_valid_page_size(page_size) {
        return Err(StatusCode::PageSizeError.into());
    }

    // The fixed portion must fit one data-page cell with its directory slot.
    let max_record = page_size as usize - PAGE_HEADER_SIZE - SLOT_SIZE;
    if record_length == 0 || cell_size(record_length) > max_record {
        return Err(StatusCode::InvalidRecordLength.into());
    }

    if num_keys > MAX_KEYS {
        return Err(StatusCode::InvalidKeySpec.into());
    }
    if data.len() < SPEC_HEADER_SIZE + num_keys * SPEC_ENTRY_SIZE {
        return Err(StatusCode::DataBufferTooShort.into());
    }

    let mut keys = Vec::new();
    let mut segments: Vec<KeyDescriptor> = Vec::new();
    for i in 0..num_keys {
        let at = SPEC_HEADER_SIZE + i * SPEC_ENTRY_SIZE;
        let entry = &data[at..at + SPEC_ENTRY_SIZE];

        let position = u16::from_le_bytes(entry[0..2].try_into().unwrap());
        let length = u16::from_le_bytes(entry[2..4].try_into().unwrap());
        let flags = KeyFlags::from_bits(u16::from_le_bytes(entry[4..6].try_into().unwrap()));
        let key_type = KeyType::from_u8(entry[6]);
        let null_value = entry[7];

        if length == 0 || position.checked_add(length).is_none() || position + length > record_length {
            return Err(StatusCode::InvalidKeySpec.into());
        }

        let continues = flags.is_set(KeyFlags::SEGMENTED);
        segments.push(KeyDescriptor::new(position, length, flags, key_type, null_value));
        if !continues {
            keys.push(KeyChain::new(std::mem::take(&mut segments)));
        }
    }
    if !segments.is_empty() {
        return Err(StatusCode::InvalidKeySpec.into());
    }

    for chain in &keys {
        let total = chain.total_length();
        // The cursor carries the key value; a tree node must hold a few
        // entries or it cannot split.
        if total > MAX_CURSOR_KEY || leaf_capacity(page_size, total) < 4 {
            return Err(StatusCode::InvalidKeySpec.into());
        }
    }

    Ok(FileControlRecord::new(record_length, page_size, keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(record_length: u16, page_size: u16, entries: &[(u16, u16, u16, u8, u8)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&record_length.to_le_bytes());
        data.extend_from_slice(&page_size.to_le_bytes());
        data.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        data.extend_from_slice(&[0u8; 4]);
        for (pos, len, flags, ty, null) in entries {
            data.extend_from_slice(&pos.to_le_bytes());
            data.extend_from_slice(&len.to_le_bytes());
            data.extend_from_slice(&flags.to_le_bytes());
            data.push(*ty);
            data.push(*null);
            data.extend_from_slice(&[0u8; 8]);
        }
        data
    }

    #[test]
    fn test_parse_valid_spec() {
        let data = spec(100, 4096, &[(0, 8, 0, 14, 0)]);
        let fcr = parse_creation_spec(&data).unwrap();
        assert_eq!(fcr.record_length, 100);
        assert_eq!(fcr.page_size, 4096);
        assert_eq!(fcr.keys.len(), 1);
        assert_eq!(fcr.keys[0].total_length(), 8);
    }

    #[test]
    fn test_parse_segmented_spec() {
        let seg = KeyFlags::SEGMENTED;
        let data = spec(100, 4096, &[(0, 8, seg, 0, 0), (20, 4, 0, 1, 0)]);
        let fcr = parse_creation_spec(&data).unwrap();
        assert_eq!(fcr.keys.len(), 1);
        assert_eq!(fcr.keys[0].segments().len(), 2);
        assert_eq!(fcr.keys[0].total_length(), 12);
    }

    #[test]
    fn test_parse_rejects_bad_page_size() {
        let data = spec(100, 1000, &[]);
        assert_eq!(
            parse_creation_spec(&data).unwrap_err().status(),
            StatusCode::PageSizeError
        );
    }

    #[test]
    fn test_parse_rejects_bad_record_length() {
        let data = spec(0, 4096, &[]);
        assert_eq!(
            parse_creation_spec(&data).unwrap_err().status(),
            StatusCode::InvalidRecordLength
        );

        let data = spec(600, 512, &[]);
        assert_eq!(
            parse_creation_spec(&data).unwrap_err().status(),
            StatusCode::InvalidRecordLength
        );
    }

    #[test]
    fn test_parse_rejects_key_outside_record() {
        let data = spec(100, 4096, &[(96, 8, 0, 0, 0)]);
        assert_eq!(
            parse_creation_spec(&data).unwrap_err().status(),
            StatusCode::InvalidKeySpec
        );
    }

    #[test]
    fn test_parse_rejects_unterminated_segment() {
        let data = spec(100, 4096, &[(0, 8, KeyFlags::SEGMENTED, 0, 0)]);
        assert_eq!(
            parse_creation_spec(&data).unwrap_err().status(),
            StatusCode::InvalidKeySpec
        );
    }

    #[test]
    fn test_parse_rejects_truncated_payload() {
        let mut data = spec(100, 4096, &[(0, 8, 0, 0, 0)]);
        data.truncate(12);
        assert_eq!(
            parse_creation_spec(&data).unwrap_err().status(),
            StatusCode::DataBufferTooShort
        );
    }
}
