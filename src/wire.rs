//! Wire codec for the reliable-ordered transport.
//!
//! Every message leads with a common `{type, credit}` pair; eager messages
//! carry their payload inline, while large transfers run the RTS/CTS
//! handshake with the receiver describing its buffers in the CTS. All
//! fields are little-endian on the wire regardless of host order, and the
//! header structs are laid out so they can be read in place from a receive
//! buffer.

use num_enum::TryFromPrimitive;
use zerocopy::little_endian::{I32, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::WireTuning;
use crate::error::{Error, Result};

/// Message discriminator carried in the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum MsgType {
    /// Small message, payload inline.
    EagerSend = 1,
    /// Small unexpected message, payload inline.
    EagerSendUnexpected = 2,
    /// Request to send a large message.
    Rts = 3,
    /// Clear to send: receiver's buffer list for the transfer.
    Cts = 4,
    /// Sender finished writing the bulk data.
    RtsDone = 5,
    /// Credit return with no other content.
    Credit = 6,
    /// Orderly connection shutdown.
    Bye = 7,
}

/// Lead-in shared by every message.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MsgHeaderCommon {
    /// A [`MsgType`] value.
    pub msg_type: U32,
    /// Receive credits being returned to the peer.
    pub credit: U32,
}

/// Header of an eager message; payload bytes follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MsgHeaderEager {
    /// Common lead-in.
    pub c: MsgHeaderCommon,
    /// Message tag the upper layer posted.
    pub bmi_tag: I32,
    /// Delivery class for unexpected messages.
    pub class: U32,
}

/// Header of a request-to-send.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MsgHeaderRts {
    /// Common lead-in.
    pub c: MsgHeaderCommon,
    /// Message tag the upper layer posted.
    pub bmi_tag: I32,
    /// Keeps the 64-bit fields aligned.
    pub _pad: I32,
    /// Sender-side operation handle, echoed by the CTS.
    pub mop_id: U64,
    /// Total bytes the bulk transfer will carry.
    pub tot_len: U64,
}

/// Header of a clear-to-send; three buffer arrays follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MsgHeaderCts {
    /// Common lead-in.
    pub c: MsgHeaderCommon,
    /// The RTS operation this clears.
    pub rts_mop_id: U64,
    /// Total bytes the listed buffers hold.
    pub buflist_tot_len: U64,
    /// Number of entries in each trailing array.
    pub buflist_num: U32,
    /// Keeps the trailing arrays aligned.
    pub _pad: U32,
}

/// Header of an RTS-done notification.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MsgHeaderRtsDone {
    /// Common lead-in.
    pub c: MsgHeaderCommon,
    /// The finished operation.
    pub mop_id: U64,
}

/// Bytes each CTS buffer entry occupies: address, length, rkey.
pub const CTS_BUFLIST_ENTRY_SIZE: usize = 8 + 4 + 4;

/// One remote buffer advertised in a CTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtsEntry {
    /// Remote buffer address.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u32,
    /// Remote access key.
    pub rkey: u32,
}

/// View over the three arrays trailing a CTS header.
#[derive(Debug, Clone, Copy)]
pub struct CtsBufList<'a> {
    raw: &'a [u8],
    num: usize,
}

impl<'a> CtsBufList<'a> {
    fn new(raw: &'a [u8], num: usize) -> Result<CtsBufList<'a>> {
        if raw.len() < num * CTS_BUFLIST_ENTRY_SIZE {
            return Err(Error::Corrupt("cts buffer list truncated"));
        }
        Ok(CtsBufList { raw, num })
    }

    /// Number of buffers listed.
    pub fn len(&self) -> usize {
        self.num
    }

    /// True for an empty list.
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    /// The `i`-th buffer entry.
    pub fn entry(&self, i: usize) -> CtsEntry {
        let addr_off = i * 8;
        let len_off = self.num * 8 + i * 4;
        let rkey_off = self.num * 12 + i * 4;
        CtsEntry {
            addr: u64::from_le_bytes(self.raw[addr_off..addr_off + 8].try_into().expect("sized")),
            len: u32::from_le_bytes(self.raw[len_off..len_off + 4].try_into().expect("sized")),
            rkey: u32::from_le_bytes(self.raw[rkey_off..rkey_off + 4].try_into().expect("sized")),
        }
    }

    /// Iterate the entries in order.
    pub fn iter(&self) -> impl Iterator<Item = CtsEntry> + '_ {
        (0..self.num).map(|i| self.entry(i))
    }
}

/// A decoded incoming message, borrowing the receive buffer.
#[derive(Debug)]
pub enum Message<'a> {
    /// Eager message with inline payload.
    Eager {
        /// Parsed header.
        hdr: &'a MsgHeaderEager,
        /// Payload bytes.
        payload: &'a [u8],
        /// True for the unexpected variant.
        unexpected: bool,
    },
    /// Request to send.
    Rts(&'a MsgHeaderRts),
    /// Clear to send with its buffer list.
    Cts {
        /// Parsed header.
        hdr: &'a MsgHeaderCts,
        /// The advertised buffers.
        buflist: CtsBufList<'a>,
    },
    /// Bulk data finished.
    RtsDone(&'a MsgHeaderRtsDone),
    /// Pure credit return.
    Credit(&'a MsgHeaderCommon),
    /// Connection shutdown.
    Bye(&'a MsgHeaderCommon),
}

impl Message<'_> {
    /// Credits the peer returned in this message's common header.
    pub fn credit(&self) -> u32 {
        match self {
            Message::Eager { hdr, .. } => hdr.c.credit.get(),
            Message::Rts(hdr) => hdr.c.credit.get(),
            Message::Cts { hdr, .. } => hdr.c.credit.get(),
            Message::RtsDone(hdr) => hdr.c.credit.get(),
            Message::Credit(hdr) | Message::Bye(hdr) => hdr.credit.get(),
        }
    }
}

/// Decode one message from a receive buffer.
pub fn decode(buf: &[u8]) -> Result<Message<'_>> {
    let (common, _) = MsgHeaderCommon::ref_from_prefix(buf)
        .map_err(|_| Error::Corrupt("message shorter than common header"))?;
    let msg_type = MsgType::try_from(common.msg_type.get())
        .map_err(|_| Error::Corrupt("unknown message type"))?;
    match msg_type {
        MsgType::EagerSend | MsgType::EagerSendUnexpected => {
            let (hdr, payload) = MsgHeaderEager::ref_from_prefix(buf)
                .map_err(|_| Error::Corrupt("eager header truncated"))?;
            Ok(Message::Eager {
                hdr,
                payload,
                unexpected: msg_type == MsgType::EagerSendUnexpected,
            })
        }
        MsgType::Rts => {
            let (hdr, _) = MsgHeaderRts::ref_from_prefix(buf)
                .map_err(|_| Error::Corrupt("rts header truncated"))?;
            Ok(Message::Rts(hdr))
        }
        MsgType::Cts => {
            let (hdr, rest) = MsgHeaderCts::ref_from_prefix(buf)
                .map_err(|_| Error::Corrupt("cts header truncated"))?;
            let buflist = CtsBufList::new(rest, hdr.buflist_num.get() as usize)?;
            Ok(Message::Cts { hdr, buflist })
        }
        MsgType::RtsDone => {
            let (hdr, _) = MsgHeaderRtsDone::ref_from_prefix(buf)
                .map_err(|_| Error::Corrupt("rts-done header truncated"))?;
            Ok(Message::RtsDone(hdr))
        }
        MsgType::Credit => Ok(Message::Credit(common)),
        MsgType::Bye => Ok(Message::Bye(common)),
    }
}

/// Encode an eager message.
pub fn encode_eager(
    credit: u32,
    bmi_tag: i32,
    class: u32,
    unexpected: bool,
    payload: &[u8],
) -> Vec<u8> {
    let hdr = MsgHeaderEager {
        c: MsgHeaderCommon {
            msg_type: U32::new(if unexpected {
                MsgType::EagerSendUnexpected as u32
            } else {
                MsgType::EagerSend as u32
            }),
            credit: U32::new(credit),
        },
        bmi_tag: I32::new(bmi_tag),
        class: U32::new(class),
    };
    let mut out = Vec::with_capacity(std::mem::size_of::<MsgHeaderEager>() + payload.len());
    out.extend_from_slice(hdr.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode a request-to-send.
pub fn encode_rts(credit: u32, bmi_tag: i32, mop_id: u64, tot_len: u64) -> Vec<u8> {
    let hdr = MsgHeaderRts {
        c: MsgHeaderCommon {
            msg_type: U32::new(MsgType::Rts as u32),
            credit: U32::new(credit),
        },
        bmi_tag: I32::new(bmi_tag),
        _pad: I32::new(0),
        mop_id: U64::new(mop_id),
        tot_len: U64::new(tot_len),
    };
    hdr.as_bytes().to_vec()
}

/// Encode a clear-to-send advertising `entries`.
pub fn encode_cts(credit: u32, rts_mop_id: u64, entries: &[CtsEntry]) -> Vec<u8> {
    let total: u64 = entries.iter().map(|e| e.len as u64).sum();
    let hdr = MsgHeaderCts {
        c: MsgHeaderCommon {
            msg_type: U32::new(MsgType::Cts as u32),
            credit: U32::new(credit),
        },
        rts_mop_id: U64::new(rts_mop_id),
        buflist_tot_len: U64::new(total),
        buflist_num: U32::new(entries.len() as u32),
        _pad: U32::new(0),
    };
    let mut out = Vec::with_capacity(
        std::mem::size_of::<MsgHeaderCts>() + entries.len() * CTS_BUFLIST_ENTRY_SIZE,
    );
    out.extend_from_slice(hdr.as_bytes());
    for e in entries {
        out.extend_from_slice(&e.addr.to_le_bytes());
    }
    for e in entries {
        out.extend_from_slice(&e.len.to_le_bytes());
    }
    for e in entries {
        out.extend_from_slice(&e.rkey.to_le_bytes());
    }
    out
}

/// Encode an RTS-done notification.
pub fn encode_rts_done(credit: u32, mop_id: u64) -> Vec<u8> {
    let hdr = MsgHeaderRtsDone {
        c: MsgHeaderCommon {
            msg_type: U32::new(MsgType::RtsDone as u32),
            credit: U32::new(credit),
        },
        mop_id: U64::new(mop_id),
    };
    hdr.as_bytes().to_vec()
}

/// Encode a bare credit return or a shutdown message.
pub fn encode_control(msg_type: MsgType, credit: u32) -> Vec<u8> {
    debug_assert!(matches!(msg_type, MsgType::Credit | MsgType::Bye));
    let hdr = MsgHeaderCommon {
        msg_type: U32::new(msg_type as u32),
        credit: U32::new(credit),
    };
    hdr.as_bytes().to_vec()
}

/// Receive buffers and credit accounting for one connection.
///
/// `send_credit` counts free slots on the peer; every send consumes one.
/// `return_credit` counts our buffers the peer filled that we have since
/// emptied; it piggybacks on the next outgoing header.
#[derive(Debug)]
pub struct Connection {
    bufs: Vec<Vec<u8>>,
    free: Vec<usize>,
    send_credit: u32,
    return_credit: u32,
}

impl Connection {
    /// Connection state with the tuned buffer pool; both sides start with
    /// full credit for each other.
    pub fn new(tuning: &WireTuning) -> Connection {
        let count = tuning.recv_buf_count as usize;
        Connection {
            bufs: (0..count)
                .map(|_| vec![0u8; tuning.recv_buf_size as usize])
                .collect(),
            free: (0..count).collect(),
            send_credit: tuning.recv_buf_count,
            return_credit: 0,
        }
    }

    /// Sends the peer can still absorb.
    pub fn send_credit(&self) -> u32 {
        self.send_credit
    }

    /// Take one send credit; `Busy` when the peer has no free buffers.
    pub fn consume_send_credit(&mut self) -> Result<()> {
        if self.send_credit == 0 {
            return Err(Error::Busy);
        }
        self.send_credit -= 1;
        Ok(())
    }

    /// Fold in the credits a decoded message returned to us.
    pub fn absorb_credit(&mut self, message: &Message<'_>) {
        self.send_credit += message.credit();
    }

    /// Claim a free receive buffer slot for an incoming message.
    pub fn claim_recv_buf(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Borrow a claimed buffer.
    pub fn recv_buf(&mut self, slot: usize) -> &mut [u8] {
        &mut self.bufs[slot]
    }

    /// Return an emptied buffer to the pool, accruing a return credit.
    pub fn release_recv_buf(&mut self, slot: usize) {
        debug_assert!(!self.free.contains(&slot));
        self.free.push(slot);
        self.return_credit += 1;
    }

    /// Credits to piggyback on the next send; resets the counter.
    pub fn take_return_credit(&mut self) -> u32 {
        std::mem::take(&mut self.return_credit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eager_round_trip_and_layout() {
        let msg = encode_eager(3, 42, 7, false, b"hello");
        // type, credit, tag, class all little-endian
        assert_eq!(&msg[0..4], &[1, 0, 0, 0]);
        assert_eq!(&msg[4..8], &[3, 0, 0, 0]);
        assert_eq!(&msg[8..12], &[42, 0, 0, 0]);
        assert_eq!(&msg[12..16], &[7, 0, 0, 0]);
        assert_eq!(&msg[16..], b"hello");

        match decode(&msg).unwrap() {
            Message::Eager {
                hdr,
                payload,
                unexpected,
            } => {
                assert_eq!(hdr.c.credit.get(), 3);
                assert_eq!(hdr.bmi_tag.get(), 42);
                assert_eq!(hdr.class.get(), 7);
                assert_eq!(payload, b"hello");
                assert!(!unexpected);
            }
            other => panic!("wrong decode: {other:?}"),
        }
    }

    #[test]
    fn rts_layout() {
        let msg = encode_rts(0, -1, 0x1122334455667788, 1 << 20);
        assert_eq!(msg.len(), 32);
        match decode(&msg).unwrap() {
            Message::Rts(hdr) => {
                assert_eq!(hdr.bmi_tag.get(), -1);
                assert_eq!(hdr.mop_id.get(), 0x1122334455667788);
                assert_eq!(hdr.tot_len.get(), 1 << 20);
            }
            other => panic!("wrong decode: {other:?}"),
        }
    }

    #[test]
    fn cts_buffer_list_round_trip() {
        let entries = [
            CtsEntry {
                addr: 0xdead_beef_0000,
                len: 4096,
                rkey: 0x77,
            },
            CtsEntry {
                addr: 0xfeed_0000,
                len: 512,
                rkey: 0x88,
            },
        ];
        let msg = encode_cts(1, 99, &entries);
        assert_eq!(
            msg.len(),
            std::mem::size_of::<MsgHeaderCts>() + 2 * CTS_BUFLIST_ENTRY_SIZE
        );
        match decode(&msg).unwrap() {
            Message::Cts { hdr, buflist } => {
                assert_eq!(hdr.rts_mop_id.get(), 99);
                assert_eq!(hdr.buflist_tot_len.get(), 4096 + 512);
                assert_eq!(buflist.len(), 2);
                let got: Vec<CtsEntry> = buflist.iter().collect();
                assert_eq!(got, entries);
            }
            other => panic!("wrong decode: {other:?}"),
        }
    }

    #[test]
    fn truncated_and_unknown_messages_are_rejected() {
        assert!(decode(&[1, 0]).is_err());
        let msg = encode_control(MsgType::Credit, 5);
        let mut bad = msg.clone();
        bad[0] = 200;
        assert!(decode(&bad).is_err());

        // cts claiming more entries than bytes present
        let mut cts = encode_cts(0, 1, &[]);
        let n = std::mem::size_of::<MsgHeaderCts>();
        cts[n - 8..n - 4].copy_from_slice(&5u32.to_le_bytes());
        assert!(decode(&cts).is_err());
    }

    #[test]
    fn credit_flow() {
        let tuning = WireTuning {
            recv_buf_count: 2,
            recv_buf_size: 64,
        };
        let mut conn = Connection::new(&tuning);
        assert_eq!(conn.send_credit(), 2);
        conn.consume_send_credit().unwrap();
        conn.consume_send_credit().unwrap();
        assert!(matches!(conn.consume_send_credit(), Err(Error::Busy)));

        // peer returns one credit on an incoming message
        let msg = encode_control(MsgType::Credit, 1);
        let decoded = decode(&msg).unwrap();
        conn.absorb_credit(&decoded);
        assert_eq!(conn.send_credit(), 1);
    }

    #[test]
    fn recv_pool_cycles_buffers() {
        let tuning = WireTuning {
            recv_buf_count: 2,
            recv_buf_size: 8,
        };
        let mut conn = Connection::new(&tuning);
        let a = conn.claim_recv_buf().unwrap();
        let b = conn.claim_recv_buf().unwrap();
        assert!(conn.claim_recv_buf().is_none());
        conn.recv_buf(a)[0] = 0xff;

        conn.release_recv_buf(a);
        conn.release_recv_buf(b);
        assert_eq!(conn.take_return_credit(), 2);
        assert_eq!(conn.take_return_credit(), 0);
        assert!(conn.claim_recv_buf().is_some());
    }
}
