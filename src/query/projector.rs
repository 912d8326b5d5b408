use crate::query::expression::{IncludeFields, QueryExpression};
use crate::query::tag::{known_level, result_tags, QueryTag};
use crate::tags::path::{is_private_creator, private_creator_of};
use crate::types::QueryTagLevel;
use dicom::core::Tag;
use dicom::object::InMemDicomObject;
use std::collections::BTreeSet;

/// Builds the records returned for matched resources.
///
/// A record holds the default attributes of the resource level and every coarser level, the
/// attributes that were filtered on and the attributes that were explicitly included.
/// Attributes owned by a finer level than the resource are never returned.
#[derive(Debug)]
pub struct ResultProjector<'a> {
	expression: &'a QueryExpression,
	query_tags: &'a [QueryTag],
}

impl<'a> ResultProjector<'a> {
	/// `query_tags` provides the levels of registered extended query tags.
	pub const fn new(expression: &'a QueryExpression, query_tags: &'a [QueryTag]) -> Self {
		Self {
			expression,
			query_tags,
		}
	}

	/// Returns the level owning `tag`. Attributes of unknown level are treated as instance
	/// attributes.
	fn level_of(&self, tag: Tag) -> QueryTagLevel {
		known_level(tag)
			.or_else(|| {
				self.query_tags
					.iter()
					.find(|query_tag| query_tag.tag == tag)
					.map(|query_tag| query_tag.level)
			})
			.unwrap_or(QueryTagLevel::Instance)
	}

	/// The attributes to project from `dataset`.
	pub fn selected_tags(&self, dataset: &InMemDicomObject) -> BTreeSet<Tag> {
		let level = self.expression.resource.level();
		let mut selected: BTreeSet<Tag> = [
			QueryTagLevel::Study,
			QueryTagLevel::Series,
			QueryTagLevel::Instance,
		]
		.into_iter()
		.filter(|default_level| *default_level <= level)
		.flat_map(result_tags)
		.copied()
		.collect();

		selected.extend(
			self.expression
				.filters
				.iter()
				.map(|condition| condition.query_tag.tag),
		);

		match &self.expression.include_fields {
			IncludeFields::All => selected.extend(
				dataset
					.iter()
					.map(|element| element.header().tag)
					.filter(|tag| !is_private_creator(*tag)),
			),
			IncludeFields::List(tags) => selected.extend(tags.iter().copied()),
		}

		selected.retain(|tag| self.level_of(*tag) <= level);
		selected
	}

	pub fn project(&self, dataset: &InMemDicomObject) -> InMemDicomObject {
		let mut record = InMemDicomObject::new_empty();
		for tag in self.selected_tags(dataset) {
			let Some(element) = dataset.get(tag) else {
				continue;
			};
			record.put(element.clone());

			if let Some(creator) = private_creator_of(tag).and_then(|creator| dataset.get(creator)) {
				record.put(creator.clone());
			}
		}
		record
	}
}
