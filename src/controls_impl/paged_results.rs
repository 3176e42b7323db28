use bytes::BytesMut;

use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structures::{ASNTag, Integer, OctetString, Sequence, Tag};
use lber::universal::Types;
use lber::write;

use super::{ControlParser, MakeCritical, RawControl};

pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Paged Results control ([RFC 2696](https://tools.ietf.org/html/rfc2696)).
///
/// The same structure serves as both the request and the response control.
/// In a request, `size` asks the server for the maximum number of entries
/// in the next page, and `cookie` must echo the cookie of the previous
/// response, or be empty on the first request. In a response, a non-empty
/// `cookie` announces that more pages remain; the final page of a search
/// carries an empty one.
#[derive(Clone, Debug)]
pub struct PagedResults {
    /// Requested page size (request), or the server's entry count estimate
    /// (response, where many servers just send zero).
    pub size: i32,
    /// Opaque paging state. Empty on the first request and the last response.
    pub cookie: Vec<u8>,
}

impl MakeCritical for PagedResults {}

impl From<PagedResults> for RawControl {
    fn from(pr: PagedResults) -> RawControl {
        let cookie_len = pr.cookie.len();
        let pr_vec = vec![
            Tag::Integer(Integer {
                inner: pr.size as i64,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: pr.cookie,
                ..Default::default()
            }),
        ];
        let pr_val = Tag::Sequence(Sequence {
            inner: pr_vec,
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::with_capacity(cookie_len + 16);
        write::encode_into(&mut buf, pr_val).expect("encoded");
        RawControl {
            oid: PAGED_RESULTS_OID.to_owned(),
            critical: false,
            value: Some(Vec::from(&buf[..])),
        }
    }
}

impl ControlParser for PagedResults {
    fn parse(val: &[u8]) -> PagedResults {
        let mut pr_comps = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("failed to parse paged results value"),
        }
        .expect_constructed()
        .expect("paged results components")
        .into_iter();
        let size = match parse_uint(
            pr_comps
                .next()
                .expect("element")
                .match_class(TagClass::Universal)
                .and_then(|t| t.match_id(Types::Integer as u64))
                .and_then(|t| t.expect_primitive())
                .expect("paged results size")
                .as_slice(),
        ) {
            Ok((_, size)) => size as i32,
            _ => panic!("failed to parse size"),
        };
        let cookie = pr_comps
            .next()
            .expect("element")
            .expect_primitive()
            .expect("cookie");
        PagedResults { size, cookie }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_with_cookie() {
        let rc: RawControl = PagedResults {
            size: 50,
            cookie: vec![0xca, 0xfe],
        }
        .into();
        assert_eq!(rc.oid, PAGED_RESULTS_OID);
        assert!(!rc.critical);
        let parsed: PagedResults = PagedResults::parse(rc.value.as_ref().expect("value"));
        assert_eq!(parsed.size, 50);
        assert_eq!(parsed.cookie, vec![0xca, 0xfe]);
    }

    #[test]
    fn first_request_has_empty_cookie() {
        let rc: RawControl = PagedResults {
            size: 100,
            cookie: vec![],
        }
        .into();
        let parsed: PagedResults = PagedResults::parse(rc.value.as_ref().expect("value"));
        assert_eq!(parsed.size, 100);
        assert!(parsed.cookie.is_empty());
    }

    #[test]
    fn critical_flag_is_set_by_wrapper() {
        let rc: RawControl = PagedResults {
            size: 2,
            cookie: vec![],
        }
        .critical()
        .into();
        assert!(rc.critical);
    }
}
