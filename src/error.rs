use thiserror::Error;

/// Errors detected before the first cycle: the input can't be read or
/// doesn't describe a runnable program.
#[derive(Error, Debug)]
pub(crate) enum LoadError {
    #[error("Failed to read '{path}': {source}")]
    IOError {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {0}")]
    ParseError(String),
    #[error("Invalid input:\n{}", .0.join("\n"))]
    AnalysisError(Vec<String>),
}

impl LoadError {
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            LoadError::IOError { .. } => 1,
            LoadError::ParseError(_) | LoadError::AnalysisError(_) => 2,
        }
    }
}

/// Errors raised while simulating; no output is produced for them.
#[derive(Error, Debug)]
pub(crate) enum SimError {
    #[error("Internal invariant violated in cycle {cycle}: {msg}")]
    Invariant { cycle: u64, msg: String },
    #[error("The program didn't complete within {0} cycles")]
    CycleLimit(u64),
    #[error("The pipeline diverges from the reference model: {0}")]
    Divergence(String),
}

impl SimError {
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            SimError::Invariant { .. } | SimError::Divergence(_) => 3,
            SimError::CycleLimit(_) => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_error_lists_every_message() {
        let err = LoadError::AnalysisError(vec!["trace[0]: a".to_string(), "trace[3]: b".to_string()]);
        assert_eq!(err.to_string(), "Invalid input:\ntrace[0]: a\ntrace[3]: b");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let io = LoadError::IOError { path: "x.json".to_string(), source: std::io::Error::from(std::io::ErrorKind::NotFound) };
        assert_eq!(io.exit_code(), 1);
        assert_eq!(SimError::Invariant { cycle: 3, msg: String::new() }.exit_code(), 3);
        assert_eq!(SimError::CycleLimit(10).exit_code(), 4);
    }
}
