use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BenchmarkEntry {
    #[serde(rename = "instance_id")]
    pub id: String,
    #[serde(rename = "problem_statement")]
    pub problem_text: String,
    #[serde(rename = "repo")]
    pub repository: String,
    #[serde(rename = "base_commit")]
    pub base_revision: String,
    #[serde(rename = "hints_text", default)]
    pub hints: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub created_at: String,
    #[serde(default)]
    pub patch: String,
    #[serde(default)]
    pub consumed: bool,
    #[serde(flatten)]
    pub auxiliary: AuxiliaryFields,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuxiliaryFields {
    #[serde(default, deserialize_with = "lenient_text")]
    pub text: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub test_patch: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub version: String,
    #[serde(rename = "FAIL_TO_PASS", default, deserialize_with = "lenient_text")]
    pub fail_to_pass: String,
    #[serde(rename = "PASS_TO_PASS", default, deserialize_with = "lenient_text")]
    pub pass_to_pass: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub environment_setup_commit: String,
}

// Exports disagree on whether list and timestamp columns are strings or
// structured values, so anything non-string is kept as its JSON text.
fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "problem_statement")]
    pub problem_text: String,
    #[serde(rename = "repo")]
    pub repository: String,
    #[serde(rename = "repo_download_url")]
    pub repository_clone_url: String,
    #[serde(rename = "base_commit")]
    pub base_revision: String,
    #[serde(rename = "hints_text")]
    pub hints: String,
}

impl Task {
    pub fn from_entry(entry: &BenchmarkEntry, problem_text: String) -> Self {
        Self {
            problem_text,
            repository: entry.repository.clone(),
            repository_clone_url: clone_url(&entry.repository),
            base_revision: entry.base_revision.clone(),
            hints: entry.hints.clone().unwrap_or_default(),
        }
    }
}

pub fn clone_url(repository: &str) -> String {
    format!("https://github.com/{}.git", repository.trim_matches('/'))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryRef {
    pub repository: String,
    pub base_revision: String,
}

#[derive(Deserialize)]
pub struct TaskQuery {
    pub validator_id: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_swebench_row() {
        let row = serde_json::json!({
            "instance_id": "astropy__astropy-12907",
            "text": "<issue>...</issue>",
            "repo": "astropy/astropy",
            "base_commit": "d16bfe05a744909de4b27f5875fe0d4ed41ce607",
            "problem_statement": "Modeling's separability_matrix does not compute correctly",
            "hints_text": "",
            "created_at": "2022-03-03T15:14:54Z",
            "patch": "diff --git a/x b/x",
            "test_patch": "diff --git a/t b/t",
            "version": 4.3,
            "FAIL_TO_PASS": "[\"test_a\"]",
            "PASS_TO_PASS": ["test_b", "test_c"],
            "environment_setup_commit": "298ccb478e6bf092953bca67a3d29dc6c35f6752"
        });

        let entry: BenchmarkEntry = serde_json::from_value(row).unwrap();
        assert_eq!(entry.id, "astropy__astropy-12907");
        assert_eq!(entry.repository, "astropy/astropy");
        assert_eq!(entry.hints.as_deref(), Some(""));
        assert!(!entry.consumed);
        assert_eq!(entry.auxiliary.version, "4.3");
        assert_eq!(entry.auxiliary.fail_to_pass, "[\"test_a\"]");
        assert_eq!(entry.auxiliary.pass_to_pass, "[\"test_b\",\"test_c\"]");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let row = serde_json::json!({
            "instance_id": "x",
            "repo": "o/r",
            "problem_statement": "p"
        });
        assert!(serde_json::from_value::<BenchmarkEntry>(row).is_err());
    }

    #[test]
    fn task_serializes_with_wire_names() {
        let entry: BenchmarkEntry = serde_json::from_value(serde_json::json!({
            "instance_id": "django__django-1",
            "repo": "django/django",
            "base_commit": "abc123",
            "problem_statement": "original",
            "hints_text": null
        }))
        .unwrap();

        let task = Task::from_entry(&entry, "rewritten".to_string());
        let body = serde_json::to_value(&task).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "problem_statement": "rewritten",
                "repo": "django/django",
                "repo_download_url": "https://github.com/django/django.git",
                "base_commit": "abc123",
                "hints_text": ""
            })
        );
    }
}
