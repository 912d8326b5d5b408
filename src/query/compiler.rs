//! Compiles a [`QueryExpression`] into a parameterized SQLite query.
//!
//! Core query tags are matched against the columns of the hierarchy tables. Every filter on
//! an extended query tag joins the index table of its datatype under a unique alias, anchored
//! to the hierarchy keys of the tag's level. The index tables are shared by all tags of a
//! datatype, so each join is constrained by the key of the owning tag.

use crate::query::expression::{FilterCondition, MatchValue, QueryExpression};
use crate::query::tag::QueryTagSource;
use crate::store::{IndexKeyColumns, SchemaVersion};
use crate::types::{InstanceIdentifier, PartitionKey, QueryTagLevel};
use crate::values::{format_datetime, person_name_words, time_to_micros, IndexDataType};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParameter {
	Integer(i64),
	Real(f64),
	Text(String),
}

/// SQL text and its positional parameters.
///
/// Each row of the result identifies the instance a matched resource is projected from.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
	pub sql: String,
	pub parameters: Vec<SqlParameter>,
}

impl CompiledQuery {
	pub fn bind(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
		self.parameters
			.iter()
			.fold(sqlx::query(&self.sql), |query, parameter| match parameter {
				SqlParameter::Integer(value) => query.bind(*value),
				SqlParameter::Real(value) => query.bind(*value),
				SqlParameter::Text(value) => query.bind(value.as_str()),
			})
	}

	pub async fn fetch(&self, pool: &SqlitePool) -> Result<Vec<InstanceIdentifier>, sqlx::Error> {
		let rows = self.bind().fetch_all(pool).await?;
		rows.iter().map(instance_from_row).collect()
	}
}

fn instance_from_row(row: &SqliteRow) -> Result<InstanceIdentifier, sqlx::Error> {
	Ok(InstanceIdentifier {
		partition_key: row.try_get("partition_key")?,
		study_instance_uid: row.try_get("study_instance_uid")?,
		series_instance_uid: row.try_get("series_instance_uid")?,
		sop_instance_uid: row.try_get("sop_instance_uid")?,
		watermark: row.try_get("watermark")?,
	})
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
	#[error("attribute {0} has a value representation that is not indexed")]
	UnindexedAttribute(String),
}

#[derive(Debug, Copy, Clone)]
pub struct QueryCompiler {
	schema_version: SchemaVersion,
}

const fn alias(level: QueryTagLevel) -> &'static str {
	match level {
		QueryTagLevel::Study => "st",
		QueryTagLevel::Series => "se",
		QueryTagLevel::Instance => "i",
	}
}

/// The filtered rows of a level, and the key they are paged by.
const fn source(level: QueryTagLevel) -> (&'static str, &'static str) {
	match level {
		QueryTagLevel::Study => ("study st", "study_key"),
		QueryTagLevel::Series => (
			"series se JOIN study st ON st.study_key = se.study_key",
			"series_key",
		),
		QueryTagLevel::Instance => (
			"instance i JOIN series se ON se.series_key = i.series_key \
			JOIN study st ON st.study_key = i.study_key",
			"instance_key",
		),
	}
}

impl QueryCompiler {
	pub const fn new(schema_version: SchemaVersion) -> Self {
		Self { schema_version }
	}

	pub fn compile(
		&self,
		expression: &QueryExpression,
		partition_key: PartitionKey,
	) -> Result<CompiledQuery, CompileError> {
		let level = expression.resource.level();
		let mut builder = Builder {
			columns: self.schema_version.index_key_columns(),
			joins: String::new(),
			predicates: vec![String::from("st.partition_key = ?")],
			parameters: vec![SqlParameter::Integer(partition_key)],
		};
		for (index, condition) in expression.filters.iter().enumerate() {
			builder.condition(index, condition)?;
		}

		let (from, key) = source(level);
		let level_alias = alias(level);
		let mut sql = format!(
			"SELECT {level_alias}.{key} AS {key} FROM {from}{} WHERE {} \
			ORDER BY {level_alias}.{key} DESC LIMIT ? OFFSET ?",
			builder.joins,
			builder.predicates.join(" AND "),
		);
		builder
			.parameters
			.push(SqlParameter::Integer(to_i64(expression.evaluated_limit)));
		builder
			.parameters
			.push(SqlParameter::Integer(to_i64(expression.offset)));

		// One representative instance per matched study or series: the most recent one
		let representative = match level {
			QueryTagLevel::Instance => String::from("ri.instance_key = m.instance_key"),
			_ => format!(
				"ri.watermark = (SELECT MAX(x.watermark) FROM instance x WHERE x.{key} = m.{key})"
			),
		};
		sql = format!(
			"SELECT ri.partition_key, ri.study_instance_uid, ri.series_instance_uid, \
			ri.sop_instance_uid, ri.watermark FROM ({sql}) m \
			JOIN instance ri ON {representative} ORDER BY m.{key} DESC"
		);

		Ok(CompiledQuery {
			sql,
			parameters: builder.parameters,
		})
	}
}

fn to_i64(value: usize) -> i64 {
	i64::try_from(value).unwrap_or(i64::MAX)
}

struct Builder {
	columns: &'static IndexKeyColumns,
	joins: String,
	predicates: Vec<String>,
	parameters: Vec<SqlParameter>,
}

impl Builder {
	fn condition(&mut self, index: usize, condition: &FilterCondition) -> Result<(), CompileError> {
		let query_tag = &condition.query_tag;
		let (value_column, words_column) = match &query_tag.source {
			QueryTagSource::Core { column } => {
				let table = alias(query_tag.level);
				(format!("{table}.{column}"), format!("{table}.{column}_words"))
			}
			QueryTagSource::Extended(entry) => {
				let data_type = IndexDataType::from_vr(entry.vr)
					.ok_or_else(|| CompileError::UnindexedAttribute(query_tag.name()))?;
				let table = format!("ext{index}");
				let IndexKeyColumns {
					study,
					series,
					instance,
				} = self.columns;

				let _ = write!(
					self.joins,
					" JOIN {} {table} ON {table}.partition_key = st.partition_key \
					AND {table}.{study} = st.study_key",
					data_type.table()
				);
				if entry.level >= QueryTagLevel::Series {
					let _ = write!(self.joins, " AND {table}.{series} = se.series_key");
				}
				if entry.level == QueryTagLevel::Instance {
					let _ = write!(self.joins, " AND {table}.{instance} = i.instance_key");
				}

				self.predicates.push(format!("{table}.tag_key = ?"));
				self.parameters.push(SqlParameter::Integer(entry.key));
				(
					format!("{table}.tag_value"),
					format!("{table}.tag_value_words"),
				)
			}
		};
		self.value_predicate(&value_column, &words_column, &condition.value);
		Ok(())
	}

	fn value_predicate(&mut self, column: &str, words_column: &str, value: &MatchValue) {
		match value {
			MatchValue::String(text) => self.equals(column, SqlParameter::Text(text.clone())),
			MatchValue::UidList(uids) => {
				let placeholders = vec!["?"; uids.len()].join(", ");
				self.predicates.push(format!("{column} IN ({placeholders})"));
				self.parameters
					.extend(uids.iter().cloned().map(SqlParameter::Text));
			}
			MatchValue::Long(number) => self.equals(column, SqlParameter::Integer(*number)),
			MatchValue::Double(number) => self.equals(column, SqlParameter::Real(*number)),
			MatchValue::Date(date) => self.equals(column, date_parameter(*date)),
			MatchValue::DateRange { min, max } => {
				self.between(column, date_parameter(*min), date_parameter(*max));
			}
			MatchValue::DateTime(datetime) => self.equals(column, datetime_parameter(datetime)),
			MatchValue::DateTimeRange { min, max } => {
				self.between(column, datetime_parameter(min), datetime_parameter(max));
			}
			MatchValue::Time(time) => self.equals(column, time_parameter(*time)),
			MatchValue::TimeRange { min, max } => {
				self.between(column, time_parameter(*min), time_parameter(*max));
			}
			MatchValue::PersonNameFuzzy(name) => {
				let words = person_name_words(name);
				if words.is_empty() {
					self.predicates.push(format!("{words_column} IS NOT NULL"));
				}
				for word in words.split(' ').filter(|word| !word.is_empty()) {
					self.predicates
						.push(format!("(' ' || {words_column}) LIKE ?"));
					self.parameters
						.push(SqlParameter::Text(format!("% {word}%")));
				}
			}
		}
	}

	fn equals(&mut self, column: &str, parameter: SqlParameter) {
		self.predicates.push(format!("{column} = ?"));
		self.parameters.push(parameter);
	}

	fn between(&mut self, column: &str, min: SqlParameter, max: SqlParameter) {
		self.predicates.push(format!("{column} BETWEEN ? AND ?"));
		self.parameters.push(min);
		self.parameters.push(max);
	}
}

fn date_parameter(date: NaiveDate) -> SqlParameter {
	datetime_parameter(&date.and_time(NaiveTime::MIN))
}

fn datetime_parameter(datetime: &NaiveDateTime) -> SqlParameter {
	SqlParameter::Text(format_datetime(datetime))
}

fn time_parameter(time: NaiveTime) -> SqlParameter {
	SqlParameter::Integer(time_to_micros(time))
}
