//! PKCS#11 URI parsing (RFC 7512 flavour).
//!
//! ```text
//! pkcs11:<attr>=<value>(;<attr>=<value>)*[?<attr>=<value>(;<attr>=<value>)*][#<fragment>]
//! ```
//!
//! Values are percent-decoded exactly once and kept as raw bytes: object ids are
//! binary and must not go through a lossy UTF-8 conversion.

use std::{borrow::Cow, collections::BTreeMap, fmt, str::FromStr};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, percent_encode};
use strum::{Display, EnumString, IntoStaticStr};
use tracing::{debug, trace};

use crate::{TError, TResult};

/// The only scheme this locator family recognizes
pub const PKCS11_SCHEME: &str = "pkcs11";

/// Everything but the RFC 3986 unreserved characters is encoded when writing a URI
const VALUE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Which descriptor a location attribute is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeScope {
    Library,
    Slot,
    Token,
    Session,
    Object,
}

/// Location (path) attributes understood by the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum LocationAttribute {
    #[strum(to_string = "library-manufacturer")]
    LibraryManufacturer,
    #[strum(to_string = "library-description")]
    LibraryDescription,
    #[strum(to_string = "library-version")]
    LibraryVersion,
    #[strum(to_string = "slot-description")]
    SlotDescription,
    #[strum(to_string = "slot-manufacturer")]
    SlotManufacturer,
    #[strum(to_string = "slot-id")]
    SlotId,
    #[strum(to_string = "token")]
    Token,
    #[strum(to_string = "manufacturer")]
    Manufacturer,
    #[strum(to_string = "model")]
    Model,
    #[strum(to_string = "serial")]
    Serial,
    #[strum(to_string = "session-state")]
    SessionState,
    #[strum(to_string = "object")]
    Object,
    #[strum(to_string = "id")]
    Id,
    #[strum(to_string = "type")]
    Type,
}

impl LocationAttribute {
    #[must_use]
    pub const fn scope(self) -> AttributeScope {
        match self {
            Self::LibraryManufacturer | Self::LibraryDescription | Self::LibraryVersion => {
                AttributeScope::Library
            }
            Self::SlotDescription | Self::SlotManufacturer | Self::SlotId => AttributeScope::Slot,
            Self::Token | Self::Manufacturer | Self::Model | Self::Serial => AttributeScope::Token,
            Self::SessionState => AttributeScope::Session,
            Self::Object | Self::Id | Self::Type => AttributeScope::Object,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Query attributes understood by the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum QueryAttribute {
    /// absolute path to the PKCS#11 module
    #[strum(to_string = "module-path")]
    ModulePath,
    /// platform independent module name
    #[strum(to_string = "module-name")]
    ModuleName,
    #[strum(to_string = "pin-value")]
    PinValue,
    /// `file:` URI or path of a file holding the PIN
    #[strum(to_string = "pin-source")]
    PinSource,
}

impl QueryAttribute {
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// A parsed PKCS#11 URI.
///
/// Unknown attribute names are kept (vendor extensions) but never used for matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locator {
    location: BTreeMap<String, Vec<u8>>,
    query: BTreeMap<String, Vec<u8>>,
}

impl Locator {
    /// Parse a URI.
    ///
    /// A URI with another scheme, or a `pkcs11:` URI without any location attribute,
    /// yields an empty locator rather than an error.
    ///
    /// # Errors
    /// * `NotALocator` if the string has no scheme segment at all
    /// * `MalformedLocator` if an attribute pair has no `=` or no name, or if both
    ///   `pin-value` and `pin-source` are given
    pub fn parse(uri: &str) -> TResult<Self> {
        if uri.trim().is_empty() || uri.contains(['\n', '\r']) {
            return Err(TError::NotALocator(format!("{uri:?}")));
        }
        // the fragment is ignored
        let without_fragment = uri.split_once('#').map_or(uri, |(head, _)| head);
        let (location_part, query_part) = match without_fragment.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (without_fragment, None),
        };
        if location_part.is_empty() {
            return Err(TError::NotALocator(format!("no scheme segment in {uri:?}")));
        }

        let (scheme, rest) = location_part.split_once(':').unwrap_or((location_part, ""));
        if !scheme.eq_ignore_ascii_case(PKCS11_SCHEME) || rest.trim().is_empty() {
            debug!("not a {PKCS11_SCHEME} URI with attributes, using an empty locator: {scheme}");
            return Ok(Self::default());
        }

        let location = parse_pairs(rest, "location")?;
        let query = match query_part {
            Some(query) if !query.is_empty() => parse_pairs(query, "query")?,
            _ => BTreeMap::new(),
        };
        check_pin_attributes(&query)?;
        trace!(
            "parsed URI with {} location and {} query attributes",
            location.len(),
            query.len()
        );
        Ok(Self { location, query })
    }

    /// Add or replace a location attribute, the value is not encoded
    #[must_use]
    pub fn with_location(
        mut self,
        attribute: LocationAttribute,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.location.insert(attribute.name().to_owned(), value.into());
        self
    }

    /// Add or replace a query attribute, the value is not encoded.
    ///
    /// # Errors
    /// `MalformedLocator` if the locator would carry both `pin-value` and `pin-source`
    pub fn with_query(
        mut self,
        attribute: QueryAttribute,
        value: impl Into<Vec<u8>>,
    ) -> TResult<Self> {
        self.query.insert(attribute.name().to_owned(), value.into());
        check_pin_attributes(&self.query)?;
        Ok(self)
    }

    #[must_use]
    pub const fn location(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.location
    }

    #[must_use]
    pub const fn query(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.query
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.location.is_empty() && self.query.is_empty()
    }

    #[must_use]
    pub fn location_value(&self, attribute: LocationAttribute) -> Option<&[u8]> {
        self.location.get(attribute.name()).map(Vec::as_slice)
    }

    /// The location value as text, invalid UTF-8 is replaced
    #[must_use]
    pub fn location_str(&self, attribute: LocationAttribute) -> Option<Cow<'_, str>> {
        self.location_value(attribute).map(String::from_utf8_lossy)
    }

    #[must_use]
    pub fn query_value(&self, attribute: QueryAttribute) -> Option<&[u8]> {
        self.query.get(attribute.name()).map(Vec::as_slice)
    }

    /// The recognized location attributes, in name order
    pub fn location_attributes(&self) -> impl Iterator<Item = (LocationAttribute, &[u8])> {
        self.location.iter().filter_map(|(name, value)| {
            LocationAttribute::from_str(name)
                .ok()
                .map(|attribute| (attribute, value.as_slice()))
        })
    }

    /// The recognized location attributes of one scope, in name order
    pub fn scoped_attributes(
        &self,
        scope: AttributeScope,
    ) -> impl Iterator<Item = (LocationAttribute, &[u8])> {
        self.location_attributes()
            .filter(move |(attribute, _)| attribute.scope() == scope)
    }

    #[must_use]
    pub fn has_scope(&self, scope: AttributeScope) -> bool {
        self.scoped_attributes(scope).next().is_some()
    }
}

impl FromStr for Locator {
    type Err = TError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PKCS11_SCHEME}:")?;
        write_pairs(f, &self.location)?;
        if !self.query.is_empty() {
            write!(f, "?")?;
            write_pairs(f, &self.query)?;
        }
        Ok(())
    }
}

fn write_pairs(f: &mut fmt::Formatter<'_>, pairs: &BTreeMap<String, Vec<u8>>) -> fmt::Result {
    for (i, (name, value)) in pairs.iter().enumerate() {
        if i > 0 {
            write!(f, ";")?;
        }
        write!(f, "{name}={}", percent_encode(value, VALUE_ENCODE_SET))?;
    }
    Ok(())
}

fn check_pin_attributes(query: &BTreeMap<String, Vec<u8>>) -> TResult<()> {
    if query.contains_key(QueryAttribute::PinValue.name())
        && query.contains_key(QueryAttribute::PinSource.name())
    {
        return Err(TError::MalformedLocator(
            "pin-source and pin-value cannot be used together".to_owned(),
        ));
    }
    Ok(())
}

/// Split `name=value(;name=value)*`; the first `=` of a pair splits name from value.
/// Later duplicates overwrite earlier ones.
fn parse_pairs(segment: &str, part: &str) -> TResult<BTreeMap<String, Vec<u8>>> {
    let mut attributes = BTreeMap::new();
    let mut rest = segment;
    loop {
        let (pair, remaining) = match rest.split_once(';') {
            Some((pair, remaining)) => (pair, Some(remaining)),
            None => (rest, None),
        };
        let Some((name, value)) = pair.split_once('=') else {
            return Err(TError::MalformedLocator(format!("bad {part}: {rest}")));
        };
        if name.is_empty() {
            return Err(TError::MalformedLocator(format!(
                "bad {part}: empty attribute name in {rest}"
            )));
        }
        attributes.insert(name.to_owned(), percent_decode_str(value).collect());
        match remaining {
            Some(remaining) => rest = remaining,
            None => break,
        }
    }
    Ok(attributes)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::{AttributeScope, LocationAttribute, Locator, QueryAttribute};
    use crate::{TError, TResult};

    #[test]
    fn test_parse_decodes_location() -> TResult<()> {
        let locator = Locator::parse("pkcs11:token=TokenA;object=Key%20One;id=%01%02")?;
        assert_eq!(locator.location().len(), 3);
        assert_eq!(
            locator.location_value(LocationAttribute::Token),
            Some(b"TokenA".as_slice())
        );
        assert_eq!(
            locator.location_value(LocationAttribute::Object),
            Some(b"Key One".as_slice())
        );
        assert_eq!(
            locator.location_value(LocationAttribute::Id),
            Some(b"\x01\x02".as_slice())
        );
        assert!(locator.query().is_empty());
        Ok(())
    }

    #[test]
    fn test_parse_is_deterministic() -> TResult<()> {
        let uri = "pkcs11:serial=DECC0401648;type=private?module-path=/usr/lib/softhsm/libsofthsm2.so";
        assert_eq!(Locator::parse(uri)?, Locator::parse(uri)?);
        Ok(())
    }

    #[test]
    fn test_parse_query_and_fragment() -> TResult<()> {
        let locator =
            Locator::parse("pkcs11:token=A?module-path=%2Fopt%2Flib.so;pin-value=1234#ignored")?;
        assert_eq!(
            locator.query_value(QueryAttribute::ModulePath),
            Some(b"/opt/lib.so".as_slice())
        );
        assert_eq!(
            locator.query_value(QueryAttribute::PinValue),
            Some(b"1234".as_slice())
        );
        assert_eq!(locator.query().len(), 2);
        Ok(())
    }

    #[test]
    fn test_parse_value_keeps_later_equal_signs() -> TResult<()> {
        let locator = Locator::parse("pkcs11:object=a=b;object=c")?;
        // later duplicates overwrite
        assert_eq!(
            locator.location_value(LocationAttribute::Object),
            Some(b"c".as_slice())
        );
        let locator = Locator::parse("pkcs11:object=a=b")?;
        assert_eq!(
            locator.location_value(LocationAttribute::Object),
            Some(b"a=b".as_slice())
        );
        Ok(())
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            Locator::parse("pkcs11:token=A;id"),
            Err(TError::MalformedLocator(_))
        ));
        assert!(matches!(
            Locator::parse("pkcs11:token=A;;id=1"),
            Err(TError::MalformedLocator(_))
        ));
        assert!(matches!(
            Locator::parse("pkcs11:=A"),
            Err(TError::MalformedLocator(_))
        ));
        assert!(matches!(
            Locator::parse("pkcs11:token=A?pin-value"),
            Err(TError::MalformedLocator(_))
        ));
    }

    #[test]
    fn test_parse_rejects_both_pin_attributes() {
        assert!(matches!(
            Locator::parse("pkcs11:token=A?pin-value=1;pin-source=file:/etc/pin"),
            Err(TError::MalformedLocator(_))
        ));
    }

    #[test]
    fn test_parse_other_scheme_is_empty() -> TResult<()> {
        assert!(Locator::parse("http://example")?.is_empty());
        assert!(Locator::parse("pkcs11:")?.is_empty());
        assert!(Locator::parse("no scheme at all")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_parse_not_a_locator() {
        assert!(matches!(Locator::parse(""), Err(TError::NotALocator(_))));
        assert!(matches!(
            Locator::parse("?pin-value=1"),
            Err(TError::NotALocator(_))
        ));
        assert!(matches!(
            Locator::parse("pkcs11:token=A\nB"),
            Err(TError::NotALocator(_))
        ));
    }

    #[test]
    fn test_scoped_attributes() -> TResult<()> {
        let locator = Locator::parse(
            "pkcs11:library-description=SoftHSM;token=A;serial=42;object=k;x-vendor=1",
        )?;
        let token: Vec<_> = locator
            .scoped_attributes(AttributeScope::Token)
            .map(|(a, _)| a)
            .collect();
        assert_eq!(
            token,
            vec![LocationAttribute::Serial, LocationAttribute::Token]
        );
        assert!(locator.has_scope(AttributeScope::Library));
        assert!(!locator.has_scope(AttributeScope::Slot));
        // unknown vendor attributes are kept but not recognized
        assert_eq!(locator.location().len(), 5);
        assert_eq!(locator.location_attributes().count(), 4);
        Ok(())
    }

    #[test]
    fn test_display_reparses_to_same_locator() -> TResult<()> {
        let locator = Locator::default()
            .with_location(LocationAttribute::Object, "Key One")
            .with_location(LocationAttribute::Id, vec![0x01, 0xff])
            .with_query(QueryAttribute::ModulePath, "/usr/lib/p11.so")?;
        let uri = locator.to_string();
        assert_eq!(
            uri,
            "pkcs11:id=%01%FF;object=Key%20One?module-path=%2Fusr%2Flib%2Fp11.so"
        );
        assert_eq!(uri.parse::<Locator>().unwrap(), locator);
        Ok(())
    }

    #[test]
    fn test_builder_rejects_both_pin_attributes() -> TResult<()> {
        let locator = Locator::default()
            .with_location(LocationAttribute::Token, "A")
            .with_query(QueryAttribute::PinValue, "1234")?;
        assert!(matches!(
            locator.clone().with_query(QueryAttribute::PinSource, "file:/etc/pin"),
            Err(TError::MalformedLocator(_))
        ));
        // replacing the same attribute is fine
        let locator = locator.with_query(QueryAttribute::PinValue, "5678")?;
        assert_eq!(
            locator.query_value(QueryAttribute::PinValue),
            Some(b"5678".as_slice())
        );
        Ok(())
    }
}
