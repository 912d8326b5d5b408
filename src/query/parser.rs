use crate::query::expression::{FilterCondition, IncludeFields, MatchValue, QueryExpression};
use crate::query::tag::{core_tag, QueryTag};
use crate::tags::path::parse_tag_path;
use crate::tags::QueryStatus;
use crate::types::{QueryResource, UI};
use crate::values::{
	max_date, max_datetime, max_time, min_date, min_datetime, min_time, parse_date,
	parse_datetime, parse_time, IndexValue,
};
use chrono::NaiveDateTime;
use dicom::core::VR;
use dicom::dictionary_std::tags;
use thiserror::Error;

const INCLUDE_FIELD: &str = "includefield";
const FUZZY_MATCHING: &str = "fuzzymatching";
const LIMIT: &str = "limit";
const OFFSET: &str = "offset";

/// The raw query parameters of a search request, in the order they were supplied.
///
/// Repeated keys are kept, so that duplicate filters can be rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParameters {
	pairs: Vec<(String, String)>,
}

impl QueryParameters {
	/// Decodes an `application/x-www-form-urlencoded` query string.
	pub fn from_query(query: &str) -> Self {
		Self {
			pairs: url::form_urlencoded::parse(query.as_bytes())
				.into_owned()
				.collect(),
		}
	}

	pub fn push(&mut self, key: &str, value: &str) {
		self.pairs.push((key.to_owned(), value.to_owned()));
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.pairs
			.iter()
			.map(|(key, value)| (key.as_str(), value.as_str()))
	}
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParameters {
	fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
		Self {
			pairs: iter
				.into_iter()
				.map(|(key, value)| (key.into(), value.into()))
				.collect(),
		}
	}
}

/// The UIDs fixed by the path of a scoped resource, e.g. `/studies/{study}/series`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryScope {
	pub study_instance_uid: Option<UI>,
	pub series_instance_uid: Option<UI>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryParseError {
	#[error("unknown query parameter '{0}'")]
	UnknownAttribute(String),
	#[error("query parameter '{0}' matches several private attributes")]
	AmbiguousAttribute(String),
	#[error("querying attribute '{0}' is disabled")]
	QueryDisabled(String),
	#[error("attribute '{key}' cannot be queried for {resource}")]
	UnsupportedLevel { key: String, resource: QueryResource },
	#[error("attribute '{0}' is specified more than once")]
	DuplicateAttribute(String),
	#[error("the value of attribute '{0}' is empty")]
	EmptyValue(String),
	#[error("'{value}' is not a valid value for attribute '{key}': {reason}")]
	InvalidValue {
		key: String,
		value: String,
		reason: String,
	},
	#[error("unknown include field '{0}'")]
	UnknownIncludeField(String),
	#[error("invalid limit '{value}', expected a number between 0 and {max}")]
	InvalidLimit { value: String, max: usize },
	#[error("invalid offset '{0}'")]
	InvalidOffset(String),
	#[error("invalid fuzzymatching value '{0}', expected true or false")]
	InvalidFuzzyMatching(String),
}

/// Turns raw query parameters into a [`QueryExpression`].
#[derive(Debug, Copy, Clone)]
pub struct QueryParser {
	default_limit: usize,
	max_limit: usize,
}

impl QueryParser {
	pub const fn new(default_limit: usize, max_limit: usize) -> Self {
		Self {
			default_limit,
			max_limit,
		}
	}

	/// Parses the parameters of a search against `resource`.
	///
	/// `available` holds every query tag of the current catalog snapshot, regardless of level,
	/// so that filters on attributes of a finer level can be told apart from unknown ones.
	pub fn parse(
		&self,
		parameters: &QueryParameters,
		resource: QueryResource,
		scope: &QueryScope,
		available: &[QueryTag],
	) -> Result<QueryExpression, QueryParseError> {
		let mut include_fields = IncludeFields::List(Vec::new());
		let mut fuzzy_matching = false;
		let mut limit = 0;
		let mut offset = 0;
		let mut filters: Vec<(&str, &str)> = Vec::new();

		for (key, value) in parameters.iter() {
			match key {
				INCLUDE_FIELD => parse_include_fields(value, &mut include_fields)?,
				FUZZY_MATCHING => fuzzy_matching = parse_bool(value)?,
				LIMIT => limit = self.parse_limit(value)?,
				OFFSET => {
					offset = value
						.trim()
						.parse::<usize>()
						.map_err(|_| QueryParseError::InvalidOffset(value.to_owned()))?;
				}
				_ => filters.push((key, value)),
			}
		}

		let mut expression = QueryExpression {
			resource,
			include_fields,
			filters: Vec::new(),
			offset,
			limit,
			evaluated_limit: if limit == 0 { self.default_limit } else { limit },
			fuzzy_matching,
			erroneous_tags: Vec::new(),
		};

		let scoped = [
			(tags::STUDY_INSTANCE_UID, scope.study_instance_uid.as_deref()),
			(tags::SERIES_INSTANCE_UID, scope.series_instance_uid.as_deref()),
		];
		for (tag, uid) in scoped {
			let (Some(uid), Some(core)) = (uid, core_tag(tag)) else {
				continue;
			};
			expression.filters.push(FilterCondition {
				query_tag: QueryTag::from_core(core),
				value: MatchValue::String(uid.to_owned()),
			});
		}

		for (key, value) in filters {
			let condition = parse_filter(key, value, &expression, available)?;
			if let Some(entry) = condition.query_tag.extended_entry() {
				let name = condition.query_tag.name();
				if entry.is_erroneous() && !expression.erroneous_tags.contains(&name) {
					expression.erroneous_tags.push(name);
				}
			}
			expression.filters.push(condition);
		}

		Ok(expression)
	}

	fn parse_limit(&self, value: &str) -> Result<usize, QueryParseError> {
		let invalid = || QueryParseError::InvalidLimit {
			value: value.to_owned(),
			max: self.max_limit,
		};
		let limit = value.trim().parse::<usize>().map_err(|_| invalid())?;
		if limit > self.max_limit {
			return Err(invalid());
		}
		Ok(limit)
	}
}

fn parse_include_fields(
	value: &str,
	include_fields: &mut IncludeFields,
) -> Result<(), QueryParseError> {
	for name in value.split(',').map(str::trim).filter(|name| !name.is_empty()) {
		if name.eq_ignore_ascii_case("all") {
			*include_fields = IncludeFields::All;
			continue;
		}
		let tag = parse_tag_path(name)
			.map_err(|_| QueryParseError::UnknownIncludeField(name.to_owned()))?;
		if let IncludeFields::List(tags) = include_fields {
			if !tags.contains(&tag) {
				tags.push(tag);
			}
		}
	}
	Ok(())
}

fn parse_bool(value: &str) -> Result<bool, QueryParseError> {
	match value.trim().to_ascii_lowercase().as_str() {
		"true" => Ok(true),
		"false" => Ok(false),
		_ => Err(QueryParseError::InvalidFuzzyMatching(value.to_owned())),
	}
}

fn resolve<'t>(key: &str, available: &'t [QueryTag]) -> Result<&'t QueryTag, QueryParseError> {
	let tag = parse_tag_path(key).map_err(|_| QueryParseError::UnknownAttribute(key.to_owned()))?;
	let mut candidates = available.iter().filter(|query_tag| query_tag.tag == tag);
	let resolved = candidates
		.next()
		.ok_or_else(|| QueryParseError::UnknownAttribute(key.to_owned()))?;
	if candidates.next().is_some() {
		return Err(QueryParseError::AmbiguousAttribute(key.to_owned()));
	}
	Ok(resolved)
}

fn parse_filter(
	key: &str,
	value: &str,
	expression: &QueryExpression,
	available: &[QueryTag],
) -> Result<FilterCondition, QueryParseError> {
	let query_tag = resolve(key, available)?;

	if query_tag
		.extended_entry()
		.is_some_and(|entry| entry.query_status == QueryStatus::Disabled)
	{
		return Err(QueryParseError::QueryDisabled(key.to_owned()));
	}
	if !expression.resource.supports(query_tag.level) {
		return Err(QueryParseError::UnsupportedLevel {
			key: key.to_owned(),
			resource: expression.resource,
		});
	}
	if expression.filter(query_tag.tag).is_some() {
		return Err(QueryParseError::DuplicateAttribute(key.to_owned()));
	}

	let value = value.trim();
	if value.is_empty() {
		return Err(QueryParseError::EmptyValue(key.to_owned()));
	}

	let invalid = |reason: String| QueryParseError::InvalidValue {
		key: key.to_owned(),
		value: value.to_owned(),
		reason,
	};
	let match_value =
		parse_match_value(value, query_tag.vr, expression.fuzzy_matching).map_err(invalid)?;

	Ok(FilterCondition {
		query_tag: query_tag.clone(),
		value: match_value,
	})
}

fn parse_match_value(value: &str, vr: VR, fuzzy_matching: bool) -> Result<MatchValue, String> {
	match vr {
		VR::UI => parse_uids(value),
		VR::DA => Ok(match parse_range(value, parse_date, min_date(), max_date())? {
			Some((min, max)) => MatchValue::DateRange { min, max },
			None => MatchValue::Date(parse_date(value).ok_or_else(|| malformed("date"))?),
		}),
		VR::TM => Ok(match parse_range(value, parse_time, min_time(), max_time())? {
			Some((min, max)) => MatchValue::TimeRange { min, max },
			None => MatchValue::Time(parse_time(value).ok_or_else(|| malformed("time"))?),
		}),
		VR::DT => match split_datetime_range(value) {
			Some((min, max)) => Ok(MatchValue::DateTimeRange { min, max }),
			None => parse_datetime_value(value),
		},
		VR::PN if fuzzy_matching => Ok(MatchValue::PersonNameFuzzy(value.to_owned())),
		_ => match IndexValue::parse(value, vr).map_err(|err| err.to_string())? {
			IndexValue::String(text) | IndexValue::PersonName(text) => Ok(MatchValue::String(text)),
			IndexValue::Long(number) => Ok(MatchValue::Long(number)),
			IndexValue::Double(number) => Ok(MatchValue::Double(number)),
			IndexValue::DateTime(datetime) => Ok(MatchValue::DateTime(datetime)),
		},
	}
}

/// A single DT value, where a trailing `-HHMM` is a UTC offset, or an open-ended range.
fn parse_datetime_value(value: &str) -> Result<MatchValue, String> {
	if let Some(datetime) = parse_datetime(value) {
		return Ok(MatchValue::DateTime(datetime));
	}
	match parse_range(value, parse_datetime, min_datetime(), max_datetime())? {
		Some((min, max)) => Ok(MatchValue::DateTimeRange { min, max }),
		None => Err(malformed("datetime")),
	}
}

/// Finds a `min-max` split of a DT value with both bounds present and in ascending order.
fn split_datetime_range(value: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
	value.match_indices('-').find_map(|(index, _)| {
		let min = parse_datetime(value[..index].trim())?;
		let max = parse_datetime(value[index + 1..].trim())?;
		(min <= max).then_some((min, max))
	})
}

fn malformed(kind: &str) -> String {
	format!("malformed {kind}")
}

/// Splits a UID list. Values may be separated by commas or backslashes.
fn parse_uids(value: &str) -> Result<MatchValue, String> {
	let uids: Vec<UI> = value
		.split([',', '\\'])
		.map(|uid| uid.trim().to_owned())
		.collect();
	if uids.iter().any(String::is_empty) {
		return Err(String::from("empty UID in list"));
	}
	match <[UI; 1]>::try_from(uids) {
		Ok([uid]) => Ok(MatchValue::String(uid)),
		Err(uids) => Ok(MatchValue::UidList(uids)),
	}
}

/// Parses `min-max`, where either side may be omitted.
///
/// Returns `Ok(None)` if the value is not a range.
fn parse_range<T: PartialOrd + Copy>(
	value: &str,
	parse: fn(&str) -> Option<T>,
	lowest: T,
	highest: T,
) -> Result<Option<(T, T)>, String> {
	let Some((min, max)) = value.split_once('-') else {
		return Ok(None);
	};
	let (min, max) = (min.trim(), max.trim());
	if min.is_empty() && max.is_empty() {
		return Err(String::from("both ends of the range are empty"));
	}
	let bound = |side: &str, open: T| {
		if side.is_empty() {
			Ok(open)
		} else {
			parse(side).ok_or_else(|| format!("malformed range bound '{side}'"))
		}
	};
	let min = bound(min, lowest)?;
	let max = bound(max, highest)?;
	if min > max {
		return Err(String::from("the minimum of the range is greater than its maximum"));
	}
	Ok(Some((min, max)))
}
