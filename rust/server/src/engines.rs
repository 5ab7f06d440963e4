//! Engine wiring.
//!
//! The concrete model runtime sits behind [`EngineFactory`]; this module
//! builds the factory a server instance hands to its sessions. The
//! simulated engines are the built-in backend; a real ONNX backend plugs in
//! here without touching the session pipeline.

use std::sync::Arc;

use zasr_recognizer::sim::SimEngineFactory;
use zasr_recognizer::{EngineFactory, RecognizerType};

use crate::config::ServerConfig;

/// Builds the engine factory for the configured recognizer type.
pub fn build_factory(config: &ServerConfig) -> Arc<dyn EngineFactory> {
    let factory = match config.recognizer_type {
        RecognizerType::SenseVoice => SimEngineFactory::offline(config.vad.clone()),
        RecognizerType::StreamingZipformer | RecognizerType::StreamingParaformer => {
            SimEngineFactory::online(config.online.endpoint.clone(), config.sample_rate)
        }
    };
    let factory = if config.punctuation.enabled {
        factory.with_punctuation()
    } else {
        factory
    };
    Arc::new(factory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zasr_recognizer::DecoderKind;

    #[test]
    fn factory_kind_follows_recognizer_type() {
        let mut cfg = ServerConfig::default();
        assert_eq!(build_factory(&cfg).kind(), DecoderKind::OfflineVad);

        cfg.recognizer_type = RecognizerType::StreamingZipformer;
        assert_eq!(build_factory(&cfg).kind(), DecoderKind::Online);
    }

    #[test]
    fn punctuator_present_only_when_enabled() {
        let mut cfg = ServerConfig::default();
        assert!(build_factory(&cfg).punctuator().is_none());
        cfg.punctuation.enabled = true;
        assert!(build_factory(&cfg).punctuator().is_some());
    }
}
