//! Value representation handling shared by the validator, the query compiler and the
//! index writers.
//!
//! Every indexable value representation maps onto exactly one [`IndexDataType`], which in
//! turn names the physical index table its values are stored in.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use dicom::core::VR;
use dicom::object::mem::InMemElement;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// The physical datatype of an indexed attribute value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IndexDataType {
	String,
	Long,
	Double,
	DateTime,
	PersonName,
}

impl IndexDataType {
	/// Returns the datatype used to index values of the given VR, or `None` if the VR cannot
	/// be indexed.
	pub const fn from_vr(vr: VR) -> Option<Self> {
		match vr {
			VR::AE | VR::AS | VR::CS | VR::DS | VR::IS | VR::LO | VR::SH | VR::UI => {
				Some(Self::String)
			}
			// Times are stored as microseconds since midnight
			VR::SL | VR::SS | VR::UL | VR::US | VR::TM => Some(Self::Long),
			VR::FL | VR::FD => Some(Self::Double),
			VR::DA | VR::DT => Some(Self::DateTime),
			VR::PN => Some(Self::PersonName),
			_ => None,
		}
	}

	/// The name of the index table holding values of this datatype.
	pub const fn table(self) -> &'static str {
		match self {
			Self::String => "extended_query_tag_string",
			Self::Long => "extended_query_tag_long",
			Self::Double => "extended_query_tag_double",
			Self::DateTime => "extended_query_tag_datetime",
			Self::PersonName => "extended_query_tag_person_name",
		}
	}

	pub const ALL: [Self; 5] = [
		Self::String,
		Self::Long,
		Self::Double,
		Self::DateTime,
		Self::PersonName,
	];
}

impl Display for IndexDataType {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::String => write!(f, "string"),
			Self::Long => write!(f, "long"),
			Self::Double => write!(f, "double"),
			Self::DateTime => write!(f, "datetime"),
			Self::PersonName => write!(f, "person name"),
		}
	}
}

/// A value extracted from an instance, ready to be written into an index table.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
	String(String),
	Long(i64),
	Double(f64),
	DateTime(NaiveDateTime),
	PersonName(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueError {
	#[error("failed to read value: {0}")]
	Convert(String),
	#[error("'{value}' is not a valid {vr} value")]
	Invalid { vr: String, value: String },
	#[error("{0} values cannot be indexed")]
	Unsupported(String),
}

impl IndexValue {
	pub const fn data_type(&self) -> IndexDataType {
		match self {
			Self::String(_) => IndexDataType::String,
			Self::Long(_) => IndexDataType::Long,
			Self::Double(_) => IndexDataType::Double,
			Self::DateTime(_) => IndexDataType::DateTime,
			Self::PersonName(_) => IndexDataType::PersonName,
		}
	}

	/// Extracts the first value of `element`, interpreted as `vr`.
	///
	/// Returns `Ok(None)` if the element has no value.
	pub fn from_element(element: &InMemElement, vr: VR) -> Result<Option<Self>, ValueError> {
		let text = element
			.to_str()
			.map_err(|err| ValueError::Convert(err.to_string()))?;
		let Some(first) = first_value(&text) else {
			return Ok(None);
		};
		Self::parse(first, vr).map(Some)
	}

	/// Parses a single textual value according to `vr`.
	pub fn parse(value: &str, vr: VR) -> Result<Self, ValueError> {
		let invalid = || ValueError::Invalid {
			vr: vr_code(vr),
			value: value.to_owned(),
		};
		let data_type =
			IndexDataType::from_vr(vr).ok_or_else(|| ValueError::Unsupported(vr_code(vr)))?;

		match data_type {
			IndexDataType::String => Ok(Self::String(value.to_owned())),
			IndexDataType::PersonName => Ok(Self::PersonName(value.to_owned())),
			IndexDataType::Long if vr == VR::TM => parse_time(value)
				.map(|time| Self::Long(time_to_micros(time)))
				.ok_or_else(invalid),
			IndexDataType::Long => value.parse::<i64>().map(Self::Long).map_err(|_| invalid()),
			IndexDataType::Double => value.parse::<f64>().map(Self::Double).map_err(|_| invalid()),
			IndexDataType::DateTime if vr == VR::DA => parse_date(value)
				.map(|date| Self::DateTime(date.and_time(NaiveTime::MIN)))
				.ok_or_else(invalid),
			IndexDataType::DateTime => parse_datetime(value)
				.map(Self::DateTime)
				.ok_or_else(invalid),
		}
	}
}

/// Returns the two-letter code of a value representation.
pub fn vr_code(vr: VR) -> String {
	String::from(vr.to_string())
}

/// Parses a two-letter value representation code, ignoring case.
pub fn parse_vr_code(vr: &str) -> Option<VR> {
	match vr.trim().as_bytes() {
		[first, second] => {
			VR::from_binary([first.to_ascii_uppercase(), second.to_ascii_uppercase()])
		}
		_ => None,
	}
}

pub(crate) fn first_value(text: &str) -> Option<&str> {
	text.split('\\')
		.next()
		.map(|value| value.trim_matches(|c: char| c == ' ' || c == '\0'))
		.filter(|value| !value.is_empty())
}

/// Parses a DA value (`YYYYMMDD`).
pub fn parse_date(value: &str) -> Option<NaiveDate> {
	if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	NaiveDate::parse_from_str(value, "%Y%m%d").ok()
}

/// Parses a TM value (`HH`, `HHMM`, `HHMMSS` or `HHMMSS.F{1,6}`).
pub fn parse_time(value: &str) -> Option<NaiveTime> {
	let (whole, fraction) = match value.split_once('.') {
		Some((whole, fraction)) if whole.len() == 6 => (whole, Some(fraction)),
		Some(_) => return None,
		None => (value, None),
	};
	if !matches!(whole.len(), 2 | 4 | 6) || !whole.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}

	let component = |index: usize| -> u32 {
		whole
			.get(index..index + 2)
			.and_then(|part| part.parse().ok())
			.unwrap_or(0)
	};
	let micros = match fraction {
		Some(fraction) => parse_fraction(fraction)?,
		None => 0,
	};
	NaiveTime::from_hms_micro_opt(component(0), component(2), component(4), micros)
}

/// Parses a DT value (`YYYY[MM[DD[HH[MM[SS[.F{1,6}]]]]]][&ZZXX]`).
///
/// The UTC offset suffix is validated but not applied.
pub fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
	let (value, offset) = match value.char_indices().skip(4).find(|(_, c)| matches!(c, '+' | '-')) {
		Some((index, _)) => (&value[..index], Some(&value[index + 1..])),
		None => (value, None),
	};
	if offset.is_some_and(|offset| !is_utc_offset(offset)) {
		return None;
	}

	let (whole, fraction) = match value.split_once('.') {
		Some((whole, fraction)) if whole.len() == 14 => (whole, Some(fraction)),
		Some(_) => return None,
		None => (value, None),
	};
	if !matches!(whole.len(), 4 | 6 | 8 | 10 | 12 | 14) || !whole.bytes().all(|b| b.is_ascii_digit())
	{
		return None;
	}

	let component = |range: std::ops::Range<usize>, default: u32| -> u32 {
		whole
			.get(range)
			.and_then(|part| part.parse().ok())
			.unwrap_or(default)
	};
	let year = i32::try_from(component(0..4, 1)).ok()?;
	let date = NaiveDate::from_ymd_opt(year, component(4..6, 1), component(6..8, 1))?;
	let micros = match fraction {
		Some(fraction) => parse_fraction(fraction)?,
		None => 0,
	};
	let time = NaiveTime::from_hms_micro_opt(
		component(8..10, 0),
		component(10..12, 0),
		component(12..14, 0),
		micros,
	)?;
	Some(date.and_time(time))
}

/// `HHMM` with at most 14 hours and less than 60 minutes.
fn is_utc_offset(offset: &str) -> bool {
	if offset.len() != 4 || !offset.bytes().all(|b| b.is_ascii_digit()) {
		return false;
	}
	let hours: u32 = offset[..2].parse().unwrap_or(u32::MAX);
	let minutes: u32 = offset[2..].parse().unwrap_or(u32::MAX);
	hours <= 14 && minutes < 60
}

fn parse_fraction(fraction: &str) -> Option<u32> {
	if fraction.is_empty() || fraction.len() > 6 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	let padded = format!("{fraction:0<6}");
	padded.parse().ok()
}

pub fn time_to_micros(time: NaiveTime) -> i64 {
	i64::from(time.num_seconds_from_midnight()) * 1_000_000 + i64::from(time.nanosecond() / 1_000)
}

/// The smallest date representable by the index tables.
pub fn min_date() -> NaiveDate {
	NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// The largest date representable by the index tables.
pub fn max_date() -> NaiveDate {
	NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX)
}

pub fn min_datetime() -> NaiveDateTime {
	min_date().and_time(NaiveTime::MIN)
}

pub fn max_datetime() -> NaiveDateTime {
	max_date().and_time(max_time())
}

pub const fn min_time() -> NaiveTime {
	NaiveTime::MIN
}

pub fn max_time() -> NaiveTime {
	NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or(NaiveTime::MIN)
}

/// Formats a datetime as fixed-width text, so that lexical order equals chronological order.
pub fn format_datetime(value: &NaiveDateTime) -> String {
	value.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Splits a person name into upper-case words used for fuzzy matching.
pub fn person_name_words(value: &str) -> String {
	value
		.split(|c: char| !c.is_alphanumeric())
		.filter(|word| !word.is_empty())
		.map(str::to_uppercase)
		.collect::<Vec<_>>()
		.join(" ")
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, PrimitiveValue, Tag};

	#[test]
	fn vr_mapping() {
		assert_eq!(IndexDataType::from_vr(VR::LO), Some(IndexDataType::String));
		assert_eq!(IndexDataType::from_vr(VR::TM), Some(IndexDataType::Long));
		assert_eq!(IndexDataType::from_vr(VR::FD), Some(IndexDataType::Double));
		assert_eq!(IndexDataType::from_vr(VR::DT), Some(IndexDataType::DateTime));
		assert_eq!(IndexDataType::from_vr(VR::PN), Some(IndexDataType::PersonName));
		assert_eq!(IndexDataType::from_vr(VR::SQ), None);
		assert_eq!(IndexDataType::from_vr(VR::LT), None);
	}

	#[test]
	fn parse_dates() {
		assert_eq!(parse_date("19510910"), NaiveDate::from_ymd_opt(1951, 9, 10));
		assert_eq!(parse_date("1951091"), None);
		assert_eq!(parse_date("19511310"), None);
		assert_eq!(parse_date("1951-09-10"), None);
	}

	#[test]
	fn parse_times() {
		assert_eq!(parse_time("13"), NaiveTime::from_hms_opt(13, 0, 0));
		assert_eq!(parse_time("1314"), NaiveTime::from_hms_opt(13, 14, 0));
		assert_eq!(parse_time("131415.5"), NaiveTime::from_hms_micro_opt(13, 14, 15, 500_000));
		assert_eq!(parse_time("2514"), None);
		assert_eq!(parse_time("1314.5"), None);
	}

	#[test]
	fn parse_datetimes() {
		let expected = NaiveDate::from_ymd_opt(2020, 2, 20)
			.and_then(|date| date.and_hms_micro_opt(10, 11, 12, 100));
		assert_eq!(parse_datetime("20200220101112.0001"), expected);
		assert_eq!(
			parse_datetime("2020"),
			NaiveDate::from_ymd_opt(2020, 1, 1).map(|date| date.and_time(NaiveTime::MIN))
		);
		assert_eq!(parse_datetime("20200220101112+0100"), expected.and_then(|dt| dt.with_nanosecond(0)));
		assert_eq!(parse_datetime("2020022"), None);
	}

	#[test]
	fn utc_offset_is_bounded() {
		assert!(parse_datetime("20200220-1400").is_some());
		assert!(parse_datetime("20200220+0545").is_some());
		// neither is an offset: the hour exceeds 14 or the minute exceeds 59
		assert_eq!(parse_datetime("2019-2020"), None);
		assert_eq!(parse_datetime("20200220+0190"), None);
	}

	#[test]
	fn format_is_fixed_width() {
		assert_eq!(format_datetime(&min_datetime()), "0001-01-01T00:00:00.000000");
		assert_eq!(format_datetime(&max_datetime()), "9999-12-31T23:59:59.999999");
	}

	#[test]
	fn person_name_words_are_normalized() {
		assert_eq!(person_name_words("Doe^John^^Dr."), "DOE JOHN DR");
		assert_eq!(person_name_words(""), "");
	}

	#[test]
	fn extract_first_value_from_element() {
		let element = DataElement::new(
			Tag(0x0010, 0x0020),
			VR::LO,
			PrimitiveValue::from("PAT-1 \\PAT-2"),
		);
		assert_eq!(
			IndexValue::from_element(&element, VR::LO),
			Ok(Some(IndexValue::String(String::from("PAT-1"))))
		);
	}

	#[test]
	fn extract_time_as_micros() {
		let element = DataElement::new(Tag(0x0008, 0x0030), VR::TM, PrimitiveValue::from("000001"));
		assert_eq!(
			IndexValue::from_element(&element, VR::TM),
			Ok(Some(IndexValue::Long(1_000_000)))
		);
	}

	#[test]
	fn extract_empty_element() {
		let element = DataElement::new(Tag(0x0010, 0x0020), VR::LO, PrimitiveValue::Empty);
		assert_eq!(IndexValue::from_element(&element, VR::LO), Ok(None));
	}

	#[test]
	fn reject_malformed_numbers() {
		assert!(matches!(
			IndexValue::parse("abc", VR::SL),
			Err(ValueError::Invalid { .. })
		));
	}
}
