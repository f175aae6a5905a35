use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("YAML Error: {0}")]
    YamlError(#[source] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("AVI Error: {0}")]
    AviError(#[from] avi::AviError),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Invalid Input: {0}")]
    InvalidInput(String),

    #[error("Precondition Not Met: {0}")]
    PreconditionNotMet(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Remote Cluster Error: {0}")]
    RemoteClusterError(String),

    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<Error>),

    /// NB: this is a catch-all for any other errors
    #[error("Other Error: {0}")]
    OtherError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification used by the error policies to pick a requeue strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidInput,
    TransientRemote,
    PreconditionNotMet,
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_) | Error::SerializationError(_) | Error::YamlError(_) => {
                ErrorKind::InvalidInput
            }
            Error::PreconditionNotMet(_) => ErrorKind::PreconditionNotMet,
            Error::Fatal(_) => ErrorKind::Fatal,
            Error::KubeError(kube::Error::Api(resp)) if resp.code == 404 => ErrorKind::NotFound,
            Error::KubeError(kube::Error::Api(resp)) if resp.code == 409 => {
                ErrorKind::AlreadyExists
            }
            Error::AviError(e) if e.is_not_found() => ErrorKind::NotFound,
            Error::AviError(e) if e.is_already_exists() => ErrorKind::AlreadyExists,
            // the most severe member decides
            Error::Aggregate(errors) => errors
                .iter()
                .map(Error::kind)
                .max_by_key(|k| match k {
                    ErrorKind::Fatal => 5,
                    ErrorKind::InvalidInput => 4,
                    ErrorKind::TransientRemote => 3,
                    ErrorKind::NotFound => 2,
                    ErrorKind::AlreadyExists => 1,
                    ErrorKind::PreconditionNotMet => 0,
                })
                .unwrap_or(ErrorKind::TransientRemote),
            _ => ErrorKind::TransientRemote,
        }
    }

    /// Collapses a list of phase errors; `None` when the list is empty.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Aggregate(errors)),
        }
    }

    pub fn is_kube_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 404)
    }
}

/// Custom resources owned or consumed by the operator
pub mod crd;

/// Typed client for the AVI controller REST API
pub mod avi;

/// Operator settings read from the environment
pub mod config;

pub mod conditions;
pub mod events_helper;
pub mod helper;
mod macros;
pub mod patch;
pub mod phases;

/// Renders the add-on data values consumed by the workload cluster
pub mod values;

pub mod addon;
pub mod cleanup;
pub mod haprovider;
pub mod network;
pub mod remote;
pub mod selector;
pub mod user;
pub mod webhook;

pub mod adc_controller;
pub mod cluster_controller;

/// Log and trace integrations
pub mod telemetry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_one_error_unwraps() {
        let err = Error::aggregate(vec![Error::Fatal("boom".into())]).expect("one error");
        assert!(matches!(err, Error::Fatal(_)));
        assert!(Error::aggregate(vec![]).is_none());
    }

    #[test]
    fn aggregate_kind_picks_most_severe_member() {
        let err = Error::Aggregate(vec![
            Error::PreconditionNotMet("vip".into()),
            Error::InvalidInput("cidr".into()),
            Error::OtherError("x".into()),
        ]);
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(
            Error::Aggregate(vec![Error::PreconditionNotMet("a".into())]).kind(),
            ErrorKind::PreconditionNotMet
        );
    }

    #[test]
    fn missing_objects_classify_as_not_found() {
        assert_eq!(Error::NotFound("secret".into()).kind(), ErrorKind::NotFound);
        let missing = avi::AviError::NotFound {
            kind: "network".into(),
            name: "vip-net".into(),
        };
        assert_eq!(Error::from(missing).kind(), ErrorKind::NotFound);
        assert_eq!(Error::OtherError("x".into()).kind(), ErrorKind::TransientRemote);
    }

    #[test]
    fn aggregate_message_joins_members() {
        let err = Error::Aggregate(vec![
            Error::NotFound("secret a".into()),
            Error::Fatal("b".into()),
        ]);
        assert_eq!(err.to_string(), "Not Found: secret a; Fatal: b");
    }
}
