//! `byte_stacker` bridges TCP connections across an unreliable UDP path.
//!
//! Two cooperating processes share this library: an *ingress* accepts TCP
//! clients and forwards their byte streams into a UDP "trunk", and an
//! *egress* receives from the trunk and re-originates TCP connections to
//! configured targets. Each accepted TCP client becomes a *virtual
//! connection* identified by 128 random bits, and survives loss, duplication
//! and reordering of individual UDP datagrams.
//!
//! ## Wire format
//!
//! Every datagram starts with a fixed header (little-endian, packed):
//! the 16-byte connection id followed by a u32 command. Commands:
//!
//! ```ascii
//! CreateConnect    =  1   u32 point id, u32 timeout (ms)
//! ReleaseConnect   =  2   u32 point id, u32 timeout (ms)
//! AckCreateConnect =  3   (no tail)
//! DataOut          = 11   u32 packet index, u32 data size, payload
//! DataIn           = 12   u32 packet index, u32 data size, payload
//! AckDataOut       = 21   u32 packet index
//! AckDataIn        = 22   u32 packet index
//! Live             = 31   (no tail, reserved for keepalive)
//! ```
//!
//! `DataOut` carries client-to-server bytes, `DataIn` the reverse. Payloads
//! are capped at 800 bytes; a datagram whose length disagrees with its
//! declared data size is dropped without comment, as are unknown commands
//! and commands that the receiving role does not accept.
//!
//! ## Reliability model
//!
//! There is no windowing and no congestion control. Every create and data
//! packet is kept in a retransmission cache until the matching ack arrives;
//! a 100 ms tick resends anything unacknowledged for 300 ms and tears the
//! whole virtual connection down after 2 s without an ack. Acks themselves
//! are never cached: a lost ack simply causes a retransmit, which is
//! answered again.
//!
//! Data packets carry a per-connection index that starts at 0 and increases
//! by one per chunk. The receiving side buffers out-of-order chunks and
//! writes them to its TCP socket strictly in index order, so the bytes that
//! reach the far TCP peer are always a prefix of the bytes read on the near
//! side.

pub mod args;
pub mod connect_id;
pub mod out_link;
pub mod packet;
pub mod retransmit;
pub mod trunk;
pub mod trunk_socket;
