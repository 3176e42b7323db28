use lber::structure::StructureTag;
use lber::structures::{ASNTag, Boolean, OctetString, Sequence, Tag};
use lber::universal::Types;

use log::warn;

mod paged_results;
pub use self::paged_results::PagedResults;
pub(crate) use self::paged_results::PAGED_RESULTS_OID;

/// Controls whose wire form this crate understands natively.
///
/// The enum is non-exhaustive on purpose: recognizing another control OID
/// in a later release must not break exhaustive matches in user code.
#[non_exhaustive]
#[derive(Clone, Copy, Debug)]
pub enum ControlType {
    PagedResults,
}

fn recognize_oid(oid: &str) -> Option<ControlType> {
    match oid {
        PAGED_RESULTS_OID => Some(ControlType::PagedResults),
        _ => None,
    }
}

/// What [`with_controls()`](crate::Ldap::with_controls) accepts.
///
/// A request carries a list of controls on the wire, but attaching exactly
/// one is by far the common case, so the method takes anything this trait
/// covers: a ready-made `Vec<RawControl>`, or any single value convertible
/// into a `RawControl`, which gets its one-element list built here.
pub trait IntoControlList {
    fn into_list(self) -> Vec<RawControl>;
}

impl IntoControlList for Vec<RawControl> {
    fn into_list(self) -> Vec<RawControl> {
        self
    }
}

impl<C> IntoControlList for C
where
    RawControl: From<C>,
{
    fn into_list(self) -> Vec<RawControl> {
        vec![self.into()]
    }
}

/// Request-side criticality marking.
///
/// Controls start out non-critical; calling
/// [`critical()`](#method.critical) wraps one so that the criticality flag
/// is set when it's encoded. Implemented by the controls this crate ships.
pub trait MakeCritical {
    /// Consume the control, returning its critical form.
    fn critical(self) -> CriticalControl<Self>
    where
        Self: Sized,
    {
        CriticalControl { control: self }
    }
}

/// A control whose criticality flag will be set on encoding. See
/// [`MakeCritical`](trait.MakeCritical.html).
pub struct CriticalControl<T> {
    control: T,
}

impl<T> From<CriticalControl<T>> for RawControl
where
    T: Into<RawControl>,
{
    fn from(cc: CriticalControl<T>) -> RawControl {
        let mut rc = cc.control.into();
        rc.critical = true;
        rc
    }
}

/// Decoder of a control-specific response value.
///
/// Implementing this for a response control type makes
/// [`RawControl::parse()`](struct.RawControl.html#method.parse) available
/// for it.
pub trait ControlParser {
    /// Convert the raw BER value into a control-specific struct.
    fn parse(val: &[u8]) -> Self;
}

/// One control of a response, as handed to user code.
///
/// `kind` is filled in when the control's OID is one the crate implements
/// itself; `raw` is always present and can be parsed into the concrete
/// type with [`RawControl::parse()`](struct.RawControl.html#method.parse).
#[derive(Clone, Debug)]
pub struct Control {
    /// The natively recognized control type, if any.
    pub kind: Option<ControlType>,
    /// The OID, criticality, and undecoded value.
    pub raw: RawControl,
}

/// The protocol-level form of a control: OID, criticality, value.
///
/// Serves both directions. Outbound, anything convertible into a
/// `RawControl` can ride on a request via
/// [`with_controls()`](crate::Ldap::with_controls); a control type defined
/// outside this crate only needs that conversion. Inbound, the value can
/// be decoded with [`parse()`](#method.parse) by any type implementing
/// [`ControlParser`](trait.ControlParser.html).
#[derive(Clone, Debug)]
pub struct RawControl {
    /// OID identifying the control.
    pub oid: String,
    /// Criticality flag; meaningful on requests only.
    pub critical: bool,
    /// BER-encoded control value, if the control has one.
    pub value: Option<Vec<u8>>,
}

impl RawControl {
    /// Decode the control value into the concrete control type.
    ///
    /// Panics when the control has no value; every response control this
    /// crate knows of carries one.
    pub fn parse<T: ControlParser>(&self) -> T {
        T::parse(self.value.as_deref().expect("control value"))
    }
}

/// Encode one request control as the element of the controls sequence.
pub(crate) fn encode_control(rc: RawControl) -> StructureTag {
    let mut parts = Vec::with_capacity(3);
    parts.push(Tag::OctetString(OctetString {
        inner: rc.oid.into_bytes(),
        ..Default::default()
    }));
    if rc.critical {
        parts.push(Tag::Boolean(Boolean {
            inner: true,
            ..Default::default()
        }));
    }
    if let Some(value) = rc.value {
        parts.push(Tag::OctetString(OctetString {
            inner: value,
            ..Default::default()
        }));
    }
    Tag::Sequence(Sequence {
        inner: parts,
        ..Default::default()
    })
    .into_structure()
}

/// Decode the controls of a response. A control that doesn't have the
/// RFC 4511 shape is skipped with a log message rather than poisoning the
/// rest of the response.
pub(crate) fn decode_controls(t: StructureTag) -> Vec<Control> {
    let raw_list = match t.expect_constructed() {
        Some(list) => list,
        None => {
            warn!("response controls are not a sequence");
            return vec![];
        }
    };
    let mut controls = vec![];
    for ctrl in raw_list {
        match decode_control(ctrl) {
            Some(ctrl) => controls.push(ctrl),
            None => warn!("skipping a malformed response control"),
        }
    }
    controls
}

fn decode_control(ctrl: StructureTag) -> Option<Control> {
    let mut parts = ctrl.expect_constructed()?.into_iter();
    let oid = String::from_utf8(parts.next()?.expect_primitive()?).ok()?;
    let mut critical = false;
    let mut value = None;
    // both trailing components are optional
    for part in parts {
        if part.id == Types::Boolean as u64 {
            critical = part.expect_primitive()?.first().copied().unwrap_or(0) != 0;
        } else if part.id == Types::OctetString as u64 {
            value = Some(part.expect_primitive()?);
        } else {
            return None;
        }
    }
    Some(Control {
        kind: recognize_oid(&oid),
        raw: RawControl {
            oid,
            critical,
            value,
        },
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_critical_control_with_value() {
        let rc = RawControl {
            oid: String::from(PAGED_RESULTS_OID),
            critical: true,
            value: Some(vec![0x30, 0x00]),
        };
        let decoded = decode_control(encode_control(rc)).expect("control");
        assert!(matches!(decoded.kind, Some(ControlType::PagedResults)));
        assert!(decoded.raw.critical);
        assert_eq!(decoded.raw.value.as_deref(), Some(&[0x30, 0x00][..]));
    }

    #[test]
    fn roundtrip_plain_control_without_value() {
        let rc = RawControl {
            oid: String::from("1.2.3.4"),
            critical: false,
            value: None,
        };
        let decoded = decode_control(encode_control(rc)).expect("control");
        assert!(decoded.kind.is_none());
        assert_eq!(decoded.raw.oid, "1.2.3.4");
        assert!(!decoded.raw.critical);
        assert!(decoded.raw.value.is_none());
    }

    #[test]
    fn malformed_control_is_rejected() {
        // a bare octet string where a control sequence belongs
        let not_a_control = Tag::OctetString(OctetString {
            inner: vec![1, 2, 3],
            ..Default::default()
        })
        .into_structure();
        assert!(decode_control(not_a_control).is_none());
    }
}
