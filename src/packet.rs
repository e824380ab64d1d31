use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::connect_id::{ConnectId, PointId};

/// Upper bound for the payload of a single data packet. An outbound link
/// reads TCP in chunks of this size, so every chunk fits one datagram.
pub const CHUNK_SIZE: usize = 800;

/// Receive buffer size for trunk sockets. Big enough for the largest packet
/// (header + data tail + [`CHUNK_SIZE`]) plus some slack so an oversized
/// datagram is read in full and can be rejected by length validation.
pub const RECV_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum TrunkCommand {
    CreateConnect = 1,
    ReleaseConnect = 2,
    AckCreateConnect = 3,
    DataOut = 11,
    DataIn = 12,
    AckDataOut = 21,
    AckDataIn = 22,
    Live = 31,
}

/// One trunk datagram, minus the connection id that prefixes all of them on
/// the wire. `DataOut` flows from ingress to egress, `DataIn` the other way;
/// the two ack pairs mirror that.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TrunkPacket {
    CreateConnect { point: PointId, timeout_ms: u32 },
    ReleaseConnect { point: PointId, timeout_ms: u32 },
    AckCreateConnect,
    DataOut { index: u32, payload: Vec<u8> },
    DataIn { index: u32, payload: Vec<u8> },
    AckDataOut { index: u32 },
    AckDataIn { index: u32 },
    Live,
}

impl TrunkPacket {
    pub fn command(&self) -> TrunkCommand {
        match self {
            TrunkPacket::CreateConnect { .. } => TrunkCommand::CreateConnect,
            TrunkPacket::ReleaseConnect { .. } => TrunkCommand::ReleaseConnect,
            TrunkPacket::AckCreateConnect => TrunkCommand::AckCreateConnect,
            TrunkPacket::DataOut { .. } => TrunkCommand::DataOut,
            TrunkPacket::DataIn { .. } => TrunkCommand::DataIn,
            TrunkPacket::AckDataOut { .. } => TrunkCommand::AckDataOut,
            TrunkPacket::AckDataIn { .. } => TrunkCommand::AckDataIn,
            TrunkPacket::Live => TrunkCommand::Live,
        }
    }

    /// All numbers on the wire are little-endian, fields are packed.
    pub fn ser(&self, id: ConnectId, buf: &mut BytesMut) {
        id.ser(buf);
        buf.put_u32_le(self.command().into());

        match self {
            TrunkPacket::CreateConnect { point, timeout_ms }
            | TrunkPacket::ReleaseConnect { point, timeout_ms } => {
                buf.put_u32_le(*point);
                buf.put_u32_le(*timeout_ms);
            }
            TrunkPacket::AckCreateConnect | TrunkPacket::Live => {}
            TrunkPacket::DataOut { index, payload } | TrunkPacket::DataIn { index, payload } => {
                buf.put_u32_le(*index);
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
            }
            TrunkPacket::AckDataOut { index } | TrunkPacket::AckDataIn { index } => {
                buf.put_u32_le(*index);
            }
        }
    }

    pub fn to_bytes(&self, id: ConnectId) -> bytes::Bytes {
        let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
        self.ser(id, &mut buf);
        buf.freeze()
    }

    /// Parses a received datagram. Callers turn any error into a silent drop:
    /// a packet that is too short, has an unknown command, declares an
    /// oversized payload, or whose total length disagrees with the declared
    /// data size never reaches the dispatcher.
    pub fn try_deser(datagram: &[u8]) -> anyhow::Result<(ConnectId, TrunkPacket)> {
        let buf = &mut &datagram[..];

        let id = ConnectId::try_deser(buf)?;
        let raw_command = buf.try_get_u32_le()?;
        let command = TrunkCommand::try_from(raw_command)
            .map_err(|_| anyhow!("unknown trunk command {}", raw_command))?;

        let packet = match command {
            TrunkCommand::CreateConnect => TrunkPacket::CreateConnect {
                point: buf.try_get_u32_le()?,
                timeout_ms: buf.try_get_u32_le()?,
            },
            TrunkCommand::ReleaseConnect => TrunkPacket::ReleaseConnect {
                point: buf.try_get_u32_le()?,
                timeout_ms: buf.try_get_u32_le()?,
            },
            TrunkCommand::AckCreateConnect => TrunkPacket::AckCreateConnect,
            TrunkCommand::DataOut | TrunkCommand::DataIn => {
                let index = buf.try_get_u32_le()?;
                let data_size = buf.try_get_u32_le()? as usize;
                if data_size > CHUNK_SIZE {
                    bail!("declared data size {} exceeds chunk limit", data_size);
                }
                if buf.len() != data_size {
                    bail!(
                        "datagram length disagrees with declared data size: {} vs {}",
                        buf.len(),
                        data_size
                    );
                }
                let payload = buf.to_vec();
                if command == TrunkCommand::DataOut {
                    TrunkPacket::DataOut { index, payload }
                } else {
                    TrunkPacket::DataIn { index, payload }
                }
            }
            TrunkCommand::AckDataOut => TrunkPacket::AckDataOut {
                index: buf.try_get_u32_le()?,
            },
            TrunkCommand::AckDataIn => TrunkPacket::AckDataIn {
                index: buf.try_get_u32_le()?,
            },
            TrunkCommand::Live => TrunkPacket::Live,
        };

        Ok((id, packet))
    }
}
