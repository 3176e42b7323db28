//! RFC 4515 search filter strings, compiled to their BER request form.

#![allow(clippy::result_unit_err)]

use lber::common::TagClass;
use lber::structures::{ExplicitTag, OctetString, Sequence, Tag};

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::digit1;
use nom::combinator::{map, map_res, recognize, verify};
use nom::error::{Error as NomError, ErrorKind};
use nom::multi::{many0, separated_list1};
use nom::number::complete::be_u8;
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

#[doc(hidden)]
pub fn parse(input: impl AsRef<[u8]>) -> Result<Tag, ()> {
    match expr(input.as_ref()) {
        Ok((rest, tag)) if rest.is_empty() => Ok(tag),
        _ => Err(()),
    }
}

const AND_FILT: u64 = 0;
const OR_FILT: u64 = 1;
const NOT_FILT: u64 = 2;

const EQ_MATCH: u64 = 3;
const SUBSTR_MATCH: u64 = 4;
const GTE_MATCH: u64 = 5;
const LTE_MATCH: u64 = 6;
const PRES_MATCH: u64 = 7;
const APPROX_MATCH: u64 = 8;

const SUB_INITIAL: u64 = 0;
const SUB_ANY: u64 = 1;
const SUB_FINAL: u64 = 2;

fn octet(inner: Vec<u8>) -> Tag {
    Tag::OctetString(OctetString {
        inner,
        ..Default::default()
    })
}

fn ctx_octet(id: u64, inner: Vec<u8>) -> Tag {
    Tag::OctetString(OctetString {
        class: TagClass::Context,
        id,
        inner,
    })
}

fn ctx_seq(id: u64, inner: Vec<Tag>) -> Tag {
    Tag::Sequence(Sequence {
        class: TagClass::Context,
        id,
        inner,
    })
}

fn parse_fail(i: &[u8]) -> IResult<&[u8], Tag> {
    Err(nom::Err::Error(NomError::new(i, ErrorKind::Verify)))
}

// a bare item is accepted at top level, for compatibility with the
// widespread habit of writing simple filters without parentheses
fn expr(i: &[u8]) -> IResult<&[u8], Tag> {
    alt((parenthesized, item))(i)
}

fn parenthesized(i: &[u8]) -> IResult<&[u8], Tag> {
    delimited(tag(b"("), component, tag(b")"))(i)
}

fn component(i: &[u8]) -> IResult<&[u8], Tag> {
    alt((and, or, not, item))(i)
}

fn and(i: &[u8]) -> IResult<&[u8], Tag> {
    let (i, _) = tag(b"&")(i)?;
    junction(i, AND_FILT)
}

fn or(i: &[u8]) -> IResult<&[u8], Tag> {
    let (i, _) = tag(b"|")(i)?;
    junction(i, OR_FILT)
}

// and/or differ only in the context tag; an empty set is legal and
// serves as the absolute true/false filter
fn junction(i: &[u8], id: u64) -> IResult<&[u8], Tag> {
    let (i, subs) = many0(parenthesized)(i)?;
    Ok((i, ctx_seq(id, subs)))
}

fn not(i: &[u8]) -> IResult<&[u8], Tag> {
    map(preceded(tag(b"!"), parenthesized), |sub| {
        Tag::ExplicitTag(ExplicitTag {
            class: TagClass::Context,
            id: NOT_FILT,
            inner: Box::new(sub),
        })
    })(i)
}

fn item(i: &[u8]) -> IResult<&[u8], Tag> {
    alt((ordering, equality))(i)
}

fn ordering(i: &[u8]) -> IResult<&[u8], Tag> {
    let (i, attr) = attr_description(i)?;
    let (i, op) = alt((tag(b">="), tag(b"<="), tag(b"~=")))(i)?;
    let (i, value) = assertion_value(i)?;
    let id = match op {
        b">=" => GTE_MATCH,
        b"<=" => LTE_MATCH,
        _ => APPROX_MATCH,
    };
    Ok((i, ctx_seq(id, vec![octet(attr.to_vec()), octet(value)])))
}

// the value side of "=" decides between plain equality, presence, and
// substring match, according to where the asterisks fall
fn equality(i: &[u8]) -> IResult<&[u8], Tag> {
    let (i, attr) = attr_description(i)?;
    let (i, _) = tag(b"=")(i)?;
    let (i, first) = assertion_value(i)?;
    let (i, rest) = many0(preceded(tag(b"*"), assertion_value))(i)?;
    if rest.is_empty() {
        return Ok((
            i,
            ctx_seq(EQ_MATCH, vec![octet(attr.to_vec()), octet(first)]),
        ));
    }
    if first.is_empty() && rest.len() == 1 && rest[0].is_empty() {
        return Ok((i, ctx_octet(PRES_MATCH, attr.to_vec())));
    }
    // an empty chunk between asterisks would mean "**"; only a trailing
    // one (no final part) is allowed
    if rest[..rest.len() - 1].iter().any(|chunk| chunk.is_empty()) {
        return parse_fail(i);
    }
    let mut subs = vec![];
    if !first.is_empty() {
        subs.push(ctx_octet(SUB_INITIAL, first));
    }
    let n = rest.len();
    for (k, chunk) in rest.into_iter().enumerate() {
        if chunk.is_empty() {
            break;
        }
        subs.push(ctx_octet(
            if k + 1 == n { SUB_FINAL } else { SUB_ANY },
            chunk,
        ));
    }
    Ok((
        i,
        ctx_seq(
            SUBSTR_MATCH,
            vec![
                octet(attr.to_vec()),
                Tag::Sequence(Sequence {
                    inner: subs,
                    ..Default::default()
                }),
            ],
        ),
    ))
}

// An assertion value runs until a character that can't appear raw; any
// byte may also be written as a \NN hex escape, and the reserved bytes
// (parentheses, asterisk, backslash, NUL) can only appear that way.
fn assertion_value(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map_res(take_while(is_value_byte), unescape_value)(i)
}

fn is_value_byte(c: u8) -> bool {
    c != 0 && c != b'(' && c != b')' && c != b'*'
}

fn unescape_value(raw: &[u8]) -> Result<Vec<u8>, ()> {
    let mut out = Vec::with_capacity(raw.len());
    let mut k = 0;
    while k < raw.len() {
        if raw[k] == b'\\' {
            let hi = raw.get(k + 1).copied().and_then(hex_digit).ok_or(())?;
            let lo = raw.get(k + 2).copied().and_then(hex_digit).ok_or(())?;
            out.push(hi << 4 | lo);
            k += 3;
        } else {
            out.push(raw[k]);
            k += 1;
        }
    }
    Ok(out)
}

fn hex_digit(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

// attribute type plus any ";option" suffixes
fn attr_description(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(pair(
        attr_type,
        many0(preceded(tag(b";"), take_while1(is_attr_char))),
    ))(i)
}

fn attr_type(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((numeric_oid, short_name))(i)
}

fn numeric_oid(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(separated_list1(tag(b"."), oid_arc))(i)
}

// zero is a valid arc, but leading zeroes are not
fn oid_arc(i: &[u8]) -> IResult<&[u8], &[u8]> {
    verify(digit1, |d: &[u8]| d.len() == 1 || d[0] != b'0')(i)
}

fn short_name(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(pair(
        verify(be_u8, |c: &u8| c.is_ascii_alphabetic()),
        take_while(is_attr_char),
    ))(i)
}

fn is_attr_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-'
}
