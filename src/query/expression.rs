use crate::query::tag::QueryTag;
use crate::types::{QueryResource, UI};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use dicom::core::Tag;

/// The attributes requested in addition to the defaults of the resource level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeFields {
	/// Every attribute valid at the resource level.
	All,
	List(Vec<Tag>),
}

/// The value side of a filter, typed by the value representation of the attribute.
///
/// Ranges are inclusive; open ends have already been replaced with the minimum or maximum
/// of the type.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchValue {
	String(String),
	UidList(Vec<UI>),
	Long(i64),
	Double(f64),
	Date(NaiveDate),
	DateRange { min: NaiveDate, max: NaiveDate },
	DateTime(NaiveDateTime),
	DateTimeRange { min: NaiveDateTime, max: NaiveDateTime },
	Time(NaiveTime),
	TimeRange { min: NaiveTime, max: NaiveTime },
	/// Every word of the value must prefix a word of the stored name.
	PersonNameFuzzy(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCondition {
	pub query_tag: QueryTag,
	pub value: MatchValue,
}

/// A validated search request, independent of its textual encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryExpression {
	pub resource: QueryResource,
	pub include_fields: IncludeFields,
	/// Filters in the order they were supplied.
	pub filters: Vec<FilterCondition>,
	pub offset: usize,
	/// The limit as requested, `0` if none was given.
	pub limit: usize,
	/// The limit applied to the query.
	pub evaluated_limit: usize,
	pub fuzzy_matching: bool,
	/// Names of filtered extended query tags whose index may be incomplete.
	pub erroneous_tags: Vec<String>,
}

impl QueryExpression {
	pub fn filter(&self, tag: Tag) -> Option<&FilterCondition> {
		self.filters
			.iter()
			.find(|condition| condition.query_tag.tag == tag)
	}

	pub fn has_erroneous_tags(&self) -> bool {
		!self.erroneous_tags.is_empty()
	}
}
