//! Source boundary: how raw documents reach the pipeline.

use crate::document::RawDocument;
use crate::Result;

/// A named, sequential stream of raw documents.
///
/// An `Err` item is a record the source could not produce; the driver logs it
/// as a runtime-error rejection and keeps reading. Resume re-reads and discards
/// already-processed items, so sources should yield in a stable order.
pub trait DocumentSource {
    fn name(&self) -> &str;

    fn stream(&mut self) -> Box<dyn Iterator<Item = Result<RawDocument>> + '_>;
}

/// Adapts any iterator into a [`DocumentSource`].
pub struct IterSource<I> {
    name: String,
    iter: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Result<RawDocument>>,
{
    pub fn new(name: impl Into<String>, iter: I) -> Self {
        Self {
            name: name.into(),
            iter,
        }
    }
}

type VecIter = std::iter::Map<std::vec::IntoIter<RawDocument>, fn(RawDocument) -> Result<RawDocument>>;

impl IterSource<VecIter> {
    /// Source over an in-memory batch.
    pub fn from_docs(name: impl Into<String>, docs: Vec<RawDocument>) -> Self {
        let ok: fn(RawDocument) -> Result<RawDocument> = Ok;
        Self::new(name, docs.into_iter().map(ok))
    }
}

impl<I> DocumentSource for IterSource<I>
where
    I: Iterator<Item = Result<RawDocument>>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&mut self) -> Box<dyn Iterator<Item = Result<RawDocument>> + '_> {
        Box::new(&mut self.iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineError;

    #[test]
    fn test_iter_source_streams_in_order() {
        let docs = vec![
            RawDocument::new("1", "wiki", "first"),
            RawDocument::new("2", "wiki", "second"),
        ];
        let mut source = IterSource::from_docs("wiki", docs);
        assert_eq!(source.name(), "wiki");

        let ids: Vec<String> = source.stream().map(|d| d.unwrap().id).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(source.stream().count(), 0);
    }

    #[test]
    fn test_iter_source_passes_errors_through() {
        let items = vec![
            Ok(RawDocument::new("1", "feed", "ok")),
            Err(PipelineError::Source {
                source_name: "feed".to_string(),
                message: "truncated record".to_string(),
            }),
        ];
        let mut source = IterSource::new("feed", items.into_iter());
        let results: Vec<_> = source.stream().collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
