// Copyright 2024 Oxide Computer Company

/// File name of the chunks storage schema, relative to the shared
/// directory.
pub const SCHEMA_CONFIG_FILE: &str = "chunks-storage-schema-dynamodb.yaml";

/// Weekly tables in the local DynamoDB, starting well in the past so that
/// any sample pushed by a test falls inside a configured period.
pub const SCHEMA_CONFIG_YAML: &str = "\
configs:
- from: \"2019-03-20\"
  store: aws-dynamo
  schema: v10
  index:
    prefix: cortex_
    period: 168h
  chunks:
    prefix: cortex_chunks_
    period: 168h
";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schema_is_weekly_dynamo() {
        assert!(SCHEMA_CONFIG_YAML.starts_with("configs:\n"));
        assert!(SCHEMA_CONFIG_YAML.contains("store: aws-dynamo"));
        assert_eq!(SCHEMA_CONFIG_YAML.matches("period: 168h").count(), 2);
    }
}
