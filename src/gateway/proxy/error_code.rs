//! Usage: Stable error codes used for the error-count metric and terminal accounting records.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(in crate::gateway) enum GatewayErrorCode {
    UpstreamUnavailable,
    UpstreamNon200,
    ModelColdStart,
    StreamDecode,
    StreamError,
    MissingDoneToken,
    ClientCanceled,
    StreamAborted,
    Internal,
}

impl GatewayErrorCode {
    pub(in crate::gateway) const fn as_str(self) -> &'static str {
        match self {
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::UpstreamNon200 => "upstream_non_200",
            Self::ModelColdStart => "model_cold_start",
            Self::StreamDecode => "stream_decode",
            Self::StreamError => "stream_error",
            Self::MissingDoneToken => "missing_done_token",
            Self::ClientCanceled => "client_canceled",
            Self::StreamAborted => "stream_aborted",
            Self::Internal => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayErrorCode;

    #[test]
    fn codes_are_stable_snake_case() {
        assert_eq!(GatewayErrorCode::MissingDoneToken.as_str(), "missing_done_token");
        assert_eq!(GatewayErrorCode::UpstreamNon200.as_str(), "upstream_non_200");
        assert_eq!(GatewayErrorCode::ModelColdStart.as_str(), "model_cold_start");
    }
}
