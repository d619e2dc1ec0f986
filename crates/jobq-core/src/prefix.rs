use crate::error::Error;

/// A validated `<db>.<queue>` namespace prefix, e.g. `"hyperopt.bandits"`.
///
/// MongoDB database names cannot contain `.`, so the first dot-separated
/// segment is the actual database and everything after it becomes part of
/// every collection name: `<queue>.jobs`, `<queue>.log`,
/// `<queue>.fs.files`/`.fs.chunks`. This matches the original
/// implementation, which passes `prefix + ".jobs"` straight through as a
/// fully qualified `db.collection` namespace string to its driver. The
/// driver itself splits on the *first* dot, and dotted collection names
/// (like GridFS's own `fs.files`/`fs.chunks`) are ordinary in MongoDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    database: String,
    queue: String,
}

impl Prefix {
    /// Parses and validates `raw`. A prefix must contain at least one `.`;
    /// anything else is a parse-error, fatal per the error handling
    /// design.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, Error> {
        let raw = raw.as_ref();
        let Some(dot) = raw.find('.') else {
            return Err(Error::Parse(format!(
                "prefix {raw:?} must contain at least one `.` (expected `<db>.<queue>`)"
            )));
        };
        let (database, rest) = raw.split_at(dot);
        let queue = &rest[1..];
        if database.is_empty() || queue.is_empty() {
            return Err(Error::Parse(format!(
                "prefix {raw:?} must have a non-empty db and queue name"
            )));
        }
        Ok(Self {
            database: database.to_string(),
            queue: queue.to_string(),
        })
    }

    /// The MongoDB database this prefix's collections live in.
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn jobs_collection(&self) -> String {
        format!("{}.jobs", self.queue)
    }

    pub fn log_collection(&self) -> String {
        format!("{}.log", self.queue)
    }

    /// GridFS bucket name for this queue (`<queue>.fs.files`/`.fs.chunks`).
    pub fn fs_bucket(&self) -> String {
        format!("{}.fs", self.queue)
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_prefix_without_dot() {
        assert!(Prefix::parse("noqueue").is_err());
    }

    #[test]
    fn splits_database_from_queue() {
        let p = Prefix::parse("test.gtest").unwrap();
        assert_eq!(p.database(), "test");
        assert_eq!(p.jobs_collection(), "gtest.jobs");
        assert_eq!(p.log_collection(), "gtest.log");
        assert_eq!(p.fs_bucket(), "gtest.fs");
    }

    #[test]
    fn queue_name_may_itself_contain_dots() {
        let p = Prefix::parse("hyperopt.bandits.quadratic1").unwrap();
        assert_eq!(p.database(), "hyperopt");
        assert_eq!(p.jobs_collection(), "bandits.quadratic1.jobs");
    }
}
