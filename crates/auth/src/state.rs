use std::sync::Arc;

use crate::auth::{ProviderRegistry, SessionCodec, SessionPipeline, SessionProjector, SignInService};

#[derive(Clone)]
pub struct AppState {
    codec: SessionCodec,
    pipeline: SessionPipeline,
    sign_in: Arc<SignInService>,
    projector: SessionProjector,
}

impl AppState {
    pub fn new(
        codec: SessionCodec,
        pipeline: SessionPipeline,
        sign_in: Arc<SignInService>,
    ) -> Self {
        Self {
            codec,
            pipeline,
            sign_in,
            projector: SessionProjector,
        }
    }

    pub fn codec(&self) -> &SessionCodec {
        &self.codec
    }

    pub fn pipeline(&self) -> &SessionPipeline {
        &self.pipeline
    }

    pub fn sign_in(&self) -> Arc<SignInService> {
        Arc::clone(&self.sign_in)
    }

    pub fn providers(&self) -> Arc<ProviderRegistry> {
        self.sign_in.providers()
    }

    pub fn projector(&self) -> &SessionProjector {
        &self.projector
    }
}
