//! Wire framing.
//!
//! One request, one response, repeated, over a reliable ordered stream.
//! All scalars little-endian.
//!
//! Request frame:
//!
//! ```text
//! operation        u16
//! position_block   128 bytes
//! data_length      u32, then that many data bytes
//! key_length       u16, then that many key bytes
//! key_number       i16
//! path_length      u16, then that many UTF-8 path bytes
//! lock_bias        u16
//! ```
//!
//! Response frame:
//!
//! ```text
//! status_code      u16
//! position_block   128 bytes
//! data_length      u32, then that many data bytes
//! key_length       u16, then that many key bytes
//! ```

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use xtrieve_common::constants::POSITION_BLOCK_SIZE;
use xtrieve_engine::{Request, Response};

/// Largest data buffer a frame may carry.
pub const MAX_DATA_LENGTH: usize = 16 * 1024 * 1024;
/// Largest key buffer a frame may carry.
pub const MAX_KEY_LENGTH: usize = 4096;
/// Longest path a frame may carry.
pub const MAX_PATH_LENGTH: usize = 4096;

fn oversized(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{what} length exceeds frame limit"))
}

/// Reads one request frame.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Request> {
    let operation = reader.read_u16_le().await?;

    let mut position_block = vec![0u8; POSITION_BLOCK_SIZE];
    reader.read_exact(&mut position_block).await?;

    let data_length = reader.read_u32_le().await? as usize;
    if data_length > MAX_DATA_LENGTH {
        return Err(oversized("data"));
    }
    let mut data = vec![0u8; data_length];
    reader.read_exact(&mut data).await?;

    let key_length = reader.read_u16_le().await? as usize;
    if key_length > MAX_KEY_LENGTH {
        return Err(oversized("key"));
    }
    let mut key = vec![0u8; key_length];
    reader.read_exact(&mut key).await?;

    let key_number = reader.read_i16_le().await?;

    let path_length = reader.read_u16_le().await? as usize;
    if path_length > MAX_PATH_LENGTH {
        return Err(oversized("path"));
    }
    let mut path = vec![0u8; path_length];
    reader.read_exact(&mut path).await?;
    let file_path = String::from_utf8_lossy(&path).into_owned();

    let lock_bias = reader.read_u16_le().await?;

    Ok(Request {
        operation,
        position_block,
        data,
        key,
        key_number,
        file_path,
        lock_bias,
    })
}

/// Writes one request frame (client side).
pub async fn write_request<W: AsyncWrite + Unpin>(writer: &mut W, request: &Request) -> io::Result<()> {
    let mut frame = Vec::with_capacity(2 + POSITION_BLOCK_SIZE + 16 + request.data.len() + request.key.len());
    frame.extend_from_slice(&request.operation.to_le_bytes());

    let mut block = [0u8; POSITION_BLOCK_SIZE];
    let take = request.position_block.len().min(POSITION_BLOCK_SIZE);
    block[..take].copy_from_slice(&request.position_block[..take]);
    frame.extend_from_slice(&block);

    frame.extend_from_slice(&(request.data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&request.data);
    frame.extend_from_slice(&(request.key.len() as u16).to_le_bytes());
    frame.extend_from_slice(&request.key);
    frame.extend_from_slice(&request.key_number.to_le_bytes());
    let path = request.file_path.as_bytes();
    frame.extend_from_slice(&(path.len() as u16).to_le_bytes());
    frame.extend_from_slice(path);
    frame.extend_from_slice(&request.lock_bias.to_le_bytes());

    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Writes one response frame (server side).
pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> io::Result<()> {
    let mut frame = Vec::with_capacity(2 + POSITION_BLOCK_SIZE + 6 + response.data.len() + response.key.len());
    frame.extend_from_slice(&response.status.as_u16().to_le_bytes());

    let mut block = [0u8; POSITION_BLOCK_SIZE];
    let take = response.position_block.len().min(POSITION_BLOCK_SIZE);
    block[..take].copy_from_slice(&response.position_block[..take]);
    frame.extend_from_slice(&block);

    frame.extend_from_slice(&(response.data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&response.data);
    frame.extend_from_slice(&(response.key.len() as u16).to_le_bytes());
    frame.extend_from_slice(&response.key);

    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Reads one response frame (client side).
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u16, Vec<u8>, Vec<u8>, Vec<u8>)> {
    let status = reader.read_u16_le().await?;

    let mut position_block = vec![0u8; POSITION_BLOCK_SIZE];
    reader.read_exact(&mut position_block).await?;

    let data_length = reader.read_u32_le().await? as usize;
    if data_length > MAX_DATA_LENGTH {
        return Err(oversized("data"));
    }
    let mut data = vec![0u8; data_length];
    reader.read_exact(&mut data).await?;

    let key_length = reader.read_u16_le().await? as usize;
    if key_length > MAX_KEY_LENGTH {
        return Err(oversized("key"));
    }
    let mut key = vec![0u8; key_length];
    reader.read_exact(&mut key).await?;

    Ok((status, position_block, data, key))
}
