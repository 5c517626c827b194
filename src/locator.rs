//! Record locators as used by the metadata and content service.

use std::fmt;

/// Storage coordinates of one file of one representation version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLocator {
    pub base_url: String,
    pub cloud_id: String,
    pub representation_name: String,
    pub version: String,
    pub file_name: String,
}

impl RecordLocator {
    /// Parse `{base}/records/{id}/representations/{name}/versions/{version}/files/{file}`.
    ///
    /// Returns `None` for anything that does not have exactly that shape.
    pub fn parse(url: &str) -> Option<Self> {
        let (base, rest) = url.rsplit_once("/records/")?;
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [cloud_id, "representations", name, "versions", version, "files", file]
                if [cloud_id, name, version, file].iter().all(|s| !s.is_empty()) =>
            {
                Some(Self {
                    base_url: base.to_string(),
                    cloud_id: cloud_id.to_string(),
                    representation_name: name.to_string(),
                    version: version.to_string(),
                    file_name: file.to_string(),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for RecordLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/records/{}/representations/{}/versions/{}/files/{}",
            self.base_url, self.cloud_id, self.representation_name, self.version, self.file_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_locator() {
        let url = "http://localhost:8080/mcs/records/ABC123/representations/edm/versions/v1/files/rec.xml";
        let locator = RecordLocator::parse(url).unwrap();
        assert_eq!(locator.base_url, "http://localhost:8080/mcs");
        assert_eq!(locator.cloud_id, "ABC123");
        assert_eq!(locator.representation_name, "edm");
        assert_eq!(locator.version, "v1");
        assert_eq!(locator.file_name, "rec.xml");
        assert_eq!(locator.to_string(), url);
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(RecordLocator::parse("http://host/records/ABC").is_none());
        assert!(RecordLocator::parse("http://host/records/ABC/representations/edm/versions/v1/files/").is_none());
        assert!(RecordLocator::parse("http://host/files/rec.xml").is_none());
        assert!(RecordLocator::parse("not a url").is_none());
    }
}
