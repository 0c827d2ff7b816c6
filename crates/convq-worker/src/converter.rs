//! Converter capability and the job-type routing table
//!
//! A [`Converter`] turns one input file into one output file. The processor
//! only ever calls [`Converter::convert`]; how a conversion is carried out
//! (in-process closure, external program) is the adapter's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Job type served by the default route
pub const MPP_TO_XML: &str = "convert-mpp-to-xml";

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("{0}")]
    Failed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },
}

/// What a converter reports back
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResult {
    pub converter: String,
    pub duration_ms: u64,
    /// Converter-specific details
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    /// Convert `input` into `output`. `output`'s directory exists.
    async fn convert(&self, input: &Path, output: &Path)
        -> Result<ConversionResult, ConversionError>;
}

/// Adapter for async closures
pub struct FnConverter<F> {
    name: String,
    f: F,
}

impl<F> FnConverter<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Converter for FnConverter<F>
where
    F: Fn(PathBuf, PathBuf) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ConversionError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn convert(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<ConversionResult, ConversionError> {
        let start = Instant::now();
        let details = (self.f)(input.to_path_buf(), output.to_path_buf()).await?;
        Ok(ConversionResult {
            converter: self.name.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            details,
        })
    }
}

/// Runs an external program. `{input}` and `{output}` in the arguments are
/// replaced with the file paths.
///
/// The child is killed if the conversion future is dropped, which is how a
/// timed-out conversion gets cleaned up.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn expand(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl Converter for CommandConverter {
    fn name(&self) -> &str {
        &self.program
    }

    async fn convert(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<ConversionResult, ConversionError> {
        let args = self.expand(input, output);
        debug!(program = %self.program, ?args, "Running converter");

        let start = Instant::now();
        let result = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            return Err(ConversionError::Command {
                program: self.program.clone(),
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        Ok(ConversionResult {
            converter: self.program.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            details: serde_json::json!({
                "stdout": String::from_utf8_lossy(&result.stdout).trim(),
            }),
        })
    }
}

/// How one job type is converted
#[derive(Clone)]
pub struct Route {
    pub input_ext: String,
    pub output_ext: String,
    pub converter: Arc<dyn Converter>,
}

impl Route {
    /// Whether `filename` carries this route's input extension
    pub fn accepts(&self, filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.input_ext))
    }

    /// Name of the converted file: same stem, output extension
    pub fn output_name(&self, filename: &str) -> String {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename);
        format!("{stem}.{}", self.output_ext)
    }
}

/// Job type → route
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    routes: HashMap<String, Route>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with only the MPP → XML route
    pub fn mpp_to_xml(converter: Arc<dyn Converter>) -> Self {
        Self::new().with_route(MPP_TO_XML, "mpp", "xml", converter)
    }

    pub fn with_route(
        mut self,
        job_type: impl Into<String>,
        input_ext: impl Into<String>,
        output_ext: impl Into<String>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        self.routes.insert(
            job_type.into(),
            Route {
                input_ext: input_ext.into().trim_start_matches('.').to_string(),
                output_ext: output_ext.into().trim_start_matches('.').to_string(),
                converter,
            },
        );
        self
    }

    pub fn get(&self, job_type: &str) -> Option<&Route> {
        self.routes.get(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Converter> {
        Arc::new(FnConverter::new("noop", |_input: PathBuf, _output: PathBuf| async {
            Ok::<_, ConversionError>(serde_json::Value::Null)
        }))
    }

    #[test]
    fn test_route_extension_checks() {
        let registry = ConverterRegistry::mpp_to_xml(noop());
        let route = registry.get(MPP_TO_XML).unwrap();
        assert!(route.accepts("plan.mpp"));
        assert!(route.accepts("PLAN.MPP"));
        assert!(!route.accepts("plan.xml"));
        assert!(!route.accepts("plan"));
        assert_eq!(route.output_name("a.mpp"), "a.xml");
        assert_eq!(route.output_name("a.b.mpp"), "a.b.xml");
    }

    #[test]
    fn test_leading_dot_is_ignored() {
        let registry = ConverterRegistry::new().with_route("png-to-jpg", ".png", ".jpg", noop());
        let route = registry.get("png-to-jpg").unwrap();
        assert!(route.accepts("x.png"));
        assert_eq!(route.output_name("x.png"), "x.jpg");
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_command_placeholders() {
        let cmd = CommandConverter::new("mpxj", ["--in", "{input}", "--out={output}"]);
        let args = cmd.expand(Path::new("/p/a.mpp"), Path::new("/c/a.xml"));
        assert_eq!(args, vec!["--in", "/p/a.mpp", "--out=/c/a.xml"]);
    }

    #[tokio::test]
    async fn test_fn_converter_reports_name() {
        let converter = FnConverter::new("copy", |input: PathBuf, output: PathBuf| async move {
            tokio::fs::copy(&input, &output).await?;
            Ok::<_, ConversionError>(serde_json::json!({ "copied": true }))
        });
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.txt");
        tokio::fs::write(&input, b"hello").await.unwrap();

        let result = converter
            .convert(&input, &dir.path().join("b.txt"))
            .await
            .unwrap();
        assert_eq!(result.converter, "copy");
        assert_eq!(result.details["copied"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_failure_carries_status() {
        let cmd = CommandConverter::new("sh", ["-c", "echo broken >&2; exit 3"]);
        let err = cmd
            .convert(Path::new("in"), Path::new("out"))
            .await
            .unwrap_err();
        match err {
            ConversionError::Command { stderr, .. } => assert_eq!(stderr, "broken"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
