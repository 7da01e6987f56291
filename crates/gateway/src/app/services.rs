use courier_infra::{InboundGateway, Pipeline};

/// State shared by every handler.
#[derive(Clone)]
pub struct GatewayServices {
    pub inbound: InboundGateway,
}

impl GatewayServices {
    pub fn new(inbound: InboundGateway) -> Self {
        Self { inbound }
    }

    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(pipeline.inbound().clone())
    }
}
