use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use nom::{self, cond, do_parse, named, number::streaming::be_u8, one_of, take};
use tokio_util::codec::{Decoder, Encoder};

use crate::address::{Address, MessageFlags};
use crate::constants::*;
use crate::error::*;

bitflags! {
    /// Flags carried by an all-link database record.
    pub struct AllLinkFlags: u8 {
        const IN_USE        = 1 << 7;
        /// When present, the modem is linked as a controller of the
        /// device. If absent, the modem is a responder.
        const IS_CONTROLLER = 1 << 6;
        const HAS_BEEN_USED = 1 << 1;
        const NONE          = 0;
    }
}

/// A single record from the PLM's on-board all-link database.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllLinkRecord {
    pub flags: AllLinkFlags,
    pub group: u8,
    pub to: Address,
    pub data: [u8; 3],
}

/// Which of the two all-link walk requests a [`Frame::AllLinkRecordEcho`]
/// answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllLinkWalkStep {
    First,
    Next,
}

/// A single command or response exchanged with the PLM.
///
/// Host→PLM variants (`SendStandard`, `SendExtended`, `GetFirstAllLink`,
/// `GetNextAllLink`, `GetImInfo`) are encode-only; the rest are produced by
/// the decoder from bytes the PLM sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Send a standard-length INSTEON message.
    SendStandard {
        to: Address,
        flags: MessageFlags,
        cmd1: u8,
        cmd2: u8,
    },
    /// Send an extended-length INSTEON message. `user_data` is always
    /// exactly 14 bytes on the wire; callers with shorter payloads pad
    /// with zero bytes before constructing this variant.
    SendExtended {
        to: Address,
        flags: MessageFlags,
        cmd1: u8,
        cmd2: u8,
        user_data: [u8; 14],
    },
    /// Request the first record of the PLM's all-link database.
    GetFirstAllLink,
    /// Request the next record of the PLM's all-link database.
    GetNextAllLink,
    /// Request information about the attached modem itself.
    GetImInfo,
    /// The PLM's echo of a `SendStandard`/`SendExtended` frame the host
    /// just wrote, terminated by an ACK/NAK byte.
    SendEcho {
        to: Address,
        flags: MessageFlags,
        cmd1: u8,
        cmd2: u8,
        user_data: Option<[u8; 14]>,
        ack: bool,
    },
    /// The reply to `GetImInfo`.
    ImInfoReply {
        address: Address,
        category: u8,
        subcategory: u8,
        firmware: u8,
        ack: bool,
    },
    /// An inbound standard INSTEON message from a device.
    ReceiveStandard {
        from: Address,
        to: Address,
        flags: MessageFlags,
        cmd1: u8,
        cmd2: u8,
    },
    /// An inbound extended INSTEON message from a device.
    ReceiveExtended {
        from: Address,
        to: Address,
        flags: MessageFlags,
        cmd1: u8,
        cmd2: u8,
        user_data: [u8; 14],
    },
    /// One record from the PLM's all-link database, sent spontaneously
    /// in reply to `GetFirstAllLink`/`GetNextAllLink`.
    AllLinkRecord(AllLinkRecord),
    /// The PLM's echo of a `GetFirstAllLink`/`GetNextAllLink` request.
    /// `ack == false` means there is no such record (the walk is done).
    AllLinkRecordEcho { step: AllLinkWalkStep, ack: bool },
}

impl Frame {
    /// Build a `SendExtended` frame, padding `user_data` on the right with
    /// zero bytes to exactly 14 bytes. A payload longer than 14 bytes is a
    /// programmer error and is rejected with `Error::UserDataTooLong`
    /// instead of being silently truncated.
    pub fn send_extended(
        to: Address,
        mut flags: MessageFlags,
        cmd1: u8,
        cmd2: u8,
        user_data: &[u8],
    ) -> Result<Frame, Error> {
        if user_data.len() > 14 {
            return Err(Error::UserDataTooLong);
        }
        let mut padded = [0u8; 14];
        padded[..user_data.len()].copy_from_slice(user_data);
        flags.set_extended(true);
        Ok(Frame::SendExtended { to, flags, cmd1, cmd2, user_data: padded })
    }
}

fn clone3(slice: &[u8]) -> [u8; 3] {
    let mut a = [0u8; 3];
    a.copy_from_slice(slice);
    a
}

fn clone14(slice: &[u8]) -> [u8; 14] {
    let mut a = [0u8; 14];
    a.copy_from_slice(slice);
    a
}

#[rustfmt::skip]
named!(parse_receive_standard<&[u8], Frame>,
    do_parse!(
        from: take!(3)  >>
        to: take!(3)    >>
        flags: be_u8    >>
        cmd1: be_u8     >>
        cmd2: be_u8     >>
        (Frame::ReceiveStandard {
            from: from.into(),
            to: to.into(),
            flags: MessageFlags::from_byte(flags),
            cmd1, cmd2,
        })
    )
);

#[rustfmt::skip]
named!(parse_receive_extended<&[u8], Frame>,
    do_parse!(
        from: take!(3)  >>
        to: take!(3)    >>
        flags: be_u8    >>
        cmd1: be_u8     >>
        cmd2: be_u8     >>
        data: take!(14) >>
        (Frame::ReceiveExtended {
            from: from.into(),
            to: to.into(),
            flags: MessageFlags::from_byte(flags),
            cmd1, cmd2,
            user_data: clone14(data),
        })
    )
);

#[rustfmt::skip]
named!(parse_all_link_record<&[u8], Frame>,
    do_parse!(
        link_flags: be_u8 >>
        group: be_u8      >>
        to: take!(3)      >>
        data: take!(3)    >>
        (Frame::AllLinkRecord(AllLinkRecord {
            flags: AllLinkFlags::from_bits_truncate(link_flags),
            group,
            to: to.into(),
            data: clone3(data),
        }))
    )
);

#[rustfmt::skip]
named!(parse_im_info_reply<&[u8], Frame>,
    do_parse!(
        address: take!(3)   >>
        category: be_u8     >>
        subcategory: be_u8  >>
        firmware: be_u8     >>
        ack: one_of!(&[ACK, NAK][..]) >>
        (Frame::ImInfoReply {
            address: address.into(),
            category, subcategory, firmware,
            ack: ack as u8 == ACK,
        })
    )
);

#[rustfmt::skip]
named!(parse_send_echo<&[u8], Frame>,
    do_parse!(
        to: take!(3)      >>
        flags_byte: be_u8 >>
        cmd1: be_u8       >>
        cmd2: be_u8       >>
        data: cond!(flags_byte & 0b0001_0000 != 0, take!(14)) >>
        ack: one_of!(&[ACK, NAK][..]) >>
        (Frame::SendEcho {
            to: to.into(),
            flags: MessageFlags::from_byte(flags_byte),
            cmd1, cmd2,
            user_data: data.map(clone14),
            ack: ack as u8 == ACK,
        })
    )
);

#[rustfmt::skip]
named!(parse_ack_byte<&[u8], bool>,
    do_parse!(
        ack: one_of!(&[ACK, NAK][..]) >>
        (ack as u8 == ACK)
    )
);

/// Decode exactly one frame from the front of `src`, if one is present.
///
/// Returns `Ok(None)` if `src` holds a valid-so-far but incomplete prefix
/// (more bytes are needed). Returns `Err(Error::Framing)` and drops a
/// single byte from the front of `src` if the buffer starts with an
/// unrecognized opcode (or a byte that isn't the frame start marker);
/// callers should call this function again to resynchronize.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, Error> {
    if src.is_empty() {
        return Ok(None);
    }

    if src[0] != START {
        src.advance(1);
        return Err(Error::Framing);
    }

    if src.len() < 2 {
        return Ok(None);
    }

    let code = src[1];
    let body = &src[2..];

    macro_rules! finish {
        ($result:expr) => {
            match $result {
                Ok((remainder, frame)) => {
                    let consumed = 2 + (body.len() - remainder.len());
                    src.advance(consumed);
                    Ok(Some(frame))
                }
                Err(nom::Err::Incomplete(_)) => Ok(None),
                // A known opcode with a malformed body is still a framing
                // error: drop a byte so the next attempt resynchronizes
                // instead of re-parsing the same bytes forever.
                Err(nom::Err::Error((_, kind))) => {
                    src.advance(1);
                    Err(kind.into())
                }
                Err(nom::Err::Failure((_, kind))) => {
                    src.advance(1);
                    Err(kind.into())
                }
            }
        };
    }

    match code {
        STANDARD_INSTEON_RECV => finish!(parse_receive_standard(body)),
        EXTENDED_INSTEON_RECV => finish!(parse_receive_extended(body)),
        ALL_LINK_RECORD => finish!(parse_all_link_record(body)),
        GET_IM_INFO => finish!(parse_im_info_reply(body)),
        INSTEON_SEND => finish!(parse_send_echo(body)),
        GET_FIRST_ALL_LINK_RECORD => finish!(parse_ack_byte(body).map(|(r, ack)| {
            (r, Frame::AllLinkRecordEcho { step: AllLinkWalkStep::First, ack })
        })),
        GET_NEXT_ALL_LINK_RECORD => finish!(parse_ack_byte(body).map(|(r, ack)| {
            (r, Frame::AllLinkRecordEcho { step: AllLinkWalkStep::Next, ack })
        })),
        _ => {
            src.advance(1);
            Err(Error::Framing)
        }
    }
}

/// Encode `frame` onto the end of `dst`. Only host→PLM frame kinds can be
/// encoded; encoding any other kind is a programmer error and returns
/// `Error::UnexpectedResponse` without writing anything.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), Error> {
    match *frame {
        Frame::SendStandard { to, flags, cmd1, cmd2 } => {
            dst.put_u8(START);
            dst.put_u8(INSTEON_SEND);
            dst.put_slice(&to.as_bytes());
            dst.put_u8(flags.to_byte());
            dst.put_u8(cmd1);
            dst.put_u8(cmd2);
            Ok(())
        }
        Frame::SendExtended {
            to,
            flags,
            cmd1,
            cmd2,
            ref user_data,
        } => {
            dst.put_u8(START);
            dst.put_u8(INSTEON_SEND);
            dst.put_slice(&to.as_bytes());
            dst.put_u8(flags.to_byte());
            dst.put_u8(cmd1);
            dst.put_u8(cmd2);
            dst.put_slice(&user_data[..]);
            Ok(())
        }
        Frame::GetFirstAllLink => {
            dst.put_u8(START);
            dst.put_u8(GET_FIRST_ALL_LINK_RECORD);
            Ok(())
        }
        Frame::GetNextAllLink => {
            dst.put_u8(START);
            dst.put_u8(GET_NEXT_ALL_LINK_RECORD);
            Ok(())
        }
        Frame::GetImInfo => {
            dst.put_u8(START);
            dst.put_u8(GET_IM_INFO);
            Ok(())
        }
        _ => Err(Error::UnexpectedResponse),
    }
}

pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MessageType;
    use std::str::FromStr;

    fn bytes(v: &[u8]) -> BytesMut {
        let mut b = BytesMut::new();
        b.extend_from_slice(v);
        b
    }

    #[test]
    fn encode_send_off() {
        let to = Address::from_str("22.b7.00").unwrap();
        let frame = Frame::SendStandard {
            to,
            flags: MessageFlags::default_direct(),
            cmd1: 0x13,
            cmd2: 0x00,
        };
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x02, 0x62, 0x22, 0xb7, 0x00, 0x0f, 0x13, 0x00]);
    }

    #[test]
    fn encode_send_on_with_level() {
        let to = Address::from_str("22.b7.00").unwrap();
        let frame = Frame::SendStandard {
            to,
            flags: MessageFlags::default_direct(),
            cmd1: 0x11,
            cmd2: 0x80,
        };
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x02, 0x62, 0x22, 0xb7, 0x00, 0x0f, 0x11, 0x80]);
    }

    #[test]
    fn encode_status_request() {
        let to = Address::from_str("22.b7.00").unwrap();
        let frame = Frame::SendStandard {
            to,
            flags: MessageFlags::default_direct(),
            cmd1: 0x19,
            cmd2: 0x00,
        };
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x02, 0x62, 0x22, 0xb7, 0x00, 0x0f, 0x19, 0x00]);
    }

    #[test]
    fn send_extended_pads_user_data_to_14_bytes() {
        let to = Address::from_str("22.b7.00").unwrap();
        let frame = Frame::send_extended(to, MessageFlags::default_direct(), 0x2e, 0x00, &[0x01, 0x02, 0x03])
            .unwrap();
        match frame {
            Frame::SendExtended { flags, user_data, .. } => {
                assert!(flags.extended());
                let mut expected = [0u8; 14];
                expected[0] = 0x01;
                expected[1] = 0x02;
                expected[2] = 0x03;
                assert_eq!(user_data, expected);
            }
            _ => panic!("unexpected frame: {:?}", frame),
        }
    }

    #[test]
    fn send_extended_rejects_oversized_user_data() {
        let to = Address::from_str("22.b7.00").unwrap();
        let result = Frame::send_extended(to, MessageFlags::default_direct(), 0x2e, 0x00, &[0u8; 15]);
        assert_eq!(result, Err(Error::UserDataTooLong));
    }

    #[test]
    fn encode_rejects_non_host_frame() {
        let mut buf = BytesMut::new();
        let frame = Frame::AllLinkRecordEcho { step: AllLinkWalkStep::First, ack: true };
        assert_eq!(encode_frame(&frame, &mut buf), Err(Error::UnexpectedResponse));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_status_echo_ack() {
        let mut buf = bytes(&[0x02, 0x62, 0x22, 0xb7, 0x00, 0x0f, 0x19, 0x00, 0x06]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::SendEcho {
                to: Address::from_str("22.b7.00").unwrap(),
                flags: MessageFlags::from_byte(0x0f),
                cmd1: 0x19,
                cmd2: 0x00,
                user_data: None,
                ack: true,
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_extended_echo_ack_peeks_flags_byte() {
        let mut payload = vec![0x02, 0x62, 0x22, 0xb7, 0x00, 0x1f, 0x2e, 0x00];
        payload.extend_from_slice(&[0u8; 14]);
        payload.push(0x06);
        let mut buf = bytes(&payload);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        match frame {
            Frame::SendEcho { user_data, ack, flags, .. } => {
                assert!(flags.extended());
                assert_eq!(user_data, Some([0u8; 14]));
                assert!(ack);
            }
            _ => panic!("unexpected frame: {:?}", frame),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_direct_ack_with_level() {
        let mut buf = bytes(&[0x02, 0x50, 0x22, 0xb7, 0x00, 0x11, 0x22, 0x33, 0x2b, 0x05, 0xcc]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        match frame {
            Frame::ReceiveStandard { from, to, flags, cmd1, cmd2 } => {
                assert_eq!(from, Address::from_str("22.b7.00").unwrap());
                assert_eq!(to, Address::from_str("11.22.33").unwrap());
                assert_eq!(flags.message_type(), MessageType::AckOfDirect);
                assert_eq!(cmd1, 0x05);
                assert_eq!(cmd2, 0xcc);
            }
            _ => panic!("unexpected frame: {:?}", frame),
        }
    }

    #[test]
    fn decode_is_restartable_on_truncation() {
        let full = [0x02u8, 0x62, 0x22, 0xb7, 0x00, 0x0f, 0x19, 0x00, 0x06];
        let mut buf = bytes(&full[..full.len() - 1]);
        assert_eq!(decode_frame(&mut buf), Ok(None));
        buf.extend_from_slice(&full[full.len() - 1..]);
        assert!(decode_frame(&mut buf).unwrap().is_some());
    }

    #[test]
    fn unknown_opcode_drops_one_byte_and_resyncs() {
        let mut buf = bytes(&[0x02, 0x95, 0x02, 0x69, 0x06]);
        assert_eq!(decode_frame(&mut buf), Err(Error::Framing));
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::AllLinkRecordEcho { step: AllLinkWalkStep::First, ack: true }
        );
    }

    #[test]
    fn garbage_bytes_resync_around_valid_frames() {
        let mut buf = bytes(&[0x02, 0x69, 0x06]);
        buf.extend_from_slice(&[0x01u8; 5]);
        buf.extend_from_slice(&[0x02, 0x6a, 0x15]);

        let first = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            first,
            Frame::AllLinkRecordEcho { step: AllLinkWalkStep::First, ack: true }
        );

        let mut garbage_errors = 0;
        loop {
            match decode_frame(&mut buf) {
                Err(Error::Framing) => garbage_errors += 1,
                Ok(Some(frame)) => {
                    assert_eq!(
                        frame,
                        Frame::AllLinkRecordEcho { step: AllLinkWalkStep::Next, ack: false }
                    );
                    break;
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(garbage_errors, 5);
    }

    #[test]
    fn all_link_walk_scenario() {
        let mut buf = bytes(&[0x02, 0x69, 0x06]);
        let echo = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(echo, Frame::AllLinkRecordEcho { step: AllLinkWalkStep::First, ack: true });

        let mut buf = bytes(&[0x02, 0x6a, 0x15]);
        let echo = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(echo, Frame::AllLinkRecordEcho { step: AllLinkWalkStep::Next, ack: false });
    }
}
