use std::io;

use crate::controls::{Control, RawControl};
use crate::controls_impl::{decode_controls, encode_control};
use crate::result::LdapError;
use crate::search::SearchItem;
use crate::RequestId;

use lber::common::TagClass;
use lber::parse::parse_uint;
use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Integer, Sequence, Tag};
use lber::universal::Types;
use lber::write;

use bytes::{Buf, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, Encoder};

/// Framing codec for LDAPMessage envelopes.
///
/// Decoding buffers raw bytes until a full BER-framed message is available,
/// then splits it into the message ID, the protocol op, and any response
/// controls. A malformed frame surfaces as an `io::Error`, which the
/// connection treats as fatal.
pub(crate) struct LdapCodec;

pub(crate) type MaybeControls = Option<Vec<RawControl>>;
pub(crate) type ItemSender = mpsc::UnboundedSender<(SearchItem, Vec<Control>)>;
pub(crate) type ResultSender = oneshot::Sender<Result<(Tag, Vec<Control>), LdapError>>;
#[cfg(test)]
pub(crate) type ResultReceiver = oneshot::Receiver<Result<(Tag, Vec<Control>), LdapError>>;

/// Connection-level instructions accompanying an operation request.
#[derive(Debug)]
pub(crate) enum LdapOp {
    /// An operation with a single terminal response.
    Single,
    /// A Search; intermediate items flow through the carried sender.
    Search(ItemSender),
    /// Abandonment of the operation with the given ID.
    Abandon(RequestId),
    /// Connection teardown.
    Unbind,
}

/// A fully built request on its way to the connection task.
///
/// The envelope travels either directly to the wire or, while the
/// connection is down, through the request queue, which preserves the
/// submission order.
#[derive(Debug)]
pub(crate) struct OpEnvelope {
    pub id: RequestId,
    pub op: LdapOp,
    pub tag: Tag,
    pub controls: MaybeControls,
    pub tx: ResultSender,
}

fn decoding_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "decoding error")
}

impl Decoder for LdapCodec {
    type Item = (RequestId, (Tag, Vec<Control>));
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut parser = lber::Parser::new();
        let (rest, tag) = match parser.parse(buf) {
            Err(e) if e.is_incomplete() => return Ok(None),
            Err(_) => return Err(decoding_error()),
            Ok((rest, ref tag)) => (rest, tag.clone()),
        };
        buf.advance(buf.len() - rest.len());
        let mut tags = match tag
            .match_id(Types::Sequence as u64)
            .and_then(|t| t.expect_constructed())
        {
            Some(tags) => tags,
            None => return Err(decoding_error()),
        };
        let mut maybe_controls = tags.pop().ok_or_else(decoding_error)?;
        let has_controls = match maybe_controls {
            StructureTag {
                id,
                class,
                ref payload,
            } if class == TagClass::Context && id == 0 => match *payload {
                PL::C(_) => true,
                PL::P(_) => return Err(decoding_error()),
            },
            StructureTag { id, class, .. } if class == TagClass::Context && id == 10 => {
                // Active Directory encodes the OID of a Notice of Disconnection
                // outside the ExtendedResponse sequence, where controls belong.
                // Skip the spurious element instead of failing the frame.
                maybe_controls = tags.pop().ok_or_else(decoding_error)?;
                false
            }
            _ => false,
        };
        let (protoop, controls) = if has_controls {
            (tags.pop().ok_or_else(decoding_error)?, Some(maybe_controls))
        } else {
            (maybe_controls, None)
        };
        let controls = match controls {
            Some(controls) => decode_controls(controls),
            None => vec![],
        };
        let msgid_tag = tags
            .pop()
            .ok_or_else(decoding_error)?
            .match_class(TagClass::Universal)
            .and_then(|t| t.match_id(Types::Integer as u64))
            .and_then(|t| t.expect_primitive())
            .ok_or_else(decoding_error)?;
        let msgid = match parse_uint(msgid_tag.as_slice()) {
            Ok((_, id)) => id as i32,
            _ => return Err(decoding_error()),
        };
        Ok(Some((msgid, (Tag::StructureTag(protoop), controls))))
    }
}

impl Encoder<(RequestId, Tag, MaybeControls)> for LdapCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        msg: (RequestId, Tag, MaybeControls),
        into: &mut BytesMut,
    ) -> io::Result<()> {
        let (id, tag, controls) = msg;
        let outstruct = {
            let mut msg = vec![
                Tag::Integer(Integer {
                    inner: id as i64,
                    ..Default::default()
                }),
                tag,
            ];
            if let Some(controls) = controls {
                msg.push(Tag::StructureTag(StructureTag {
                    id: 0,
                    class: TagClass::Context,
                    payload: PL::C(controls.into_iter().map(encode_control).collect()),
                }));
            }
            Tag::Sequence(Sequence {
                inner: msg,
                ..Default::default()
            })
            .into_structure()
        };
        write::encode_into(into, outstruct)?;
        Ok(())
    }
}
