use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut};
use uuid::Uuid;

/// Operator-assigned identifier for a configured TCP endpoint: a listening
/// point on the ingress, a dial target on the egress. Both sides must agree
/// on the mapping out of band.
pub type PointId = u32;

/// Identifier of one virtual connection: 128 random bits, generated by the
/// ingress when a TCP client is accepted. Only the randomness matters; the
/// nil value is reserved as "unset".
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectId(Uuid);

impl ConnectId {
    pub const NIL: ConnectId = ConnectId(Uuid::nil());

    pub const SERIALIZED_SIZE: usize = 16;

    pub fn random() -> ConnectId {
        ConnectId(Uuid::new_v4())
    }

    pub fn from_bytes(raw: [u8; 16]) -> ConnectId {
        ConnectId(Uuid::from_bytes(raw))
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectId> {
        if buf.remaining() < Self::SERIALIZED_SIZE {
            bail!("buffer too short for a connect id");
        }
        let mut raw = [0u8; Self::SERIALIZED_SIZE];
        buf.copy_to_slice(&mut raw);
        Ok(ConnectId(Uuid::from_bytes(raw)))
    }
}

impl Debug for ConnectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
