use std::collections::HashMap;

use crate::error::Result;
use crate::path::RelativePath;
use crate::session::{BoxFuture, DurableSource, Session};

/// Durable source backed by a fixed map, for sessions built in tests.
#[derive(Debug, Default, Clone)]
pub struct MapSource {
    files: HashMap<String, Vec<u8>>,
}

impl MapSource {
    pub fn with_file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.to_string(), content.into());
        self
    }
}

impl DurableSource for MapSource {
    fn fetch<'a>(&'a self, path: &'a RelativePath) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.files.get(path.as_str()).cloned()) })
    }
}

/// Stage `count` small JSON records as `{dir}/record-NNNN.json`.
pub fn stage_records(session: &mut Session, dir: &str, count: usize) -> Result<Vec<String>> {
    (0..count)
        .map(|i| {
            let path = format!("{dir}/record-{i:04}.json");
            session.write(&path, &format!("{{\"id\":{i}}}"))?;
            Ok(path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stages_numbered_records() {
        let mut session = Session::new("ABC", "mem", MapSource::default().with_file("x", "y"));
        let paths = stage_records(&mut session, "json", 3).unwrap();
        assert_eq!(paths[2], "json/record-0002.json");
        assert_eq!(session.staged_len(), 3);
        assert_eq!(session.read_text("json/record-0001.json").await.unwrap(), "{\"id\":1}");
        assert_eq!(session.read_text("x").await.unwrap(), "y");
    }
}
