use async_trait::async_trait;

use courier_core::{ConversationId, TenantId};

use crate::result::{AiError, Analysis};

/// What an analyzer may know about the message besides its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisContext {
    pub tenant_id: TenantId,
    pub conversation_id: ConversationId,
    pub contact_name: Option<String>,
}

/// AI enrichment capability.
///
/// Implementations should prefer returning [`Analysis::neutral`] over an error when
/// the backing service is degraded; callers treat any error as "not enriched".
#[async_trait]
pub trait MessageAnalyzer: Send + Sync + 'static {
    async fn analyze(&self, text: &str, context: &AnalysisContext) -> Result<Analysis, AiError>;
}

/// Analyzer used when enrichment is switched off: always neutral.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeutralAnalyzer;

#[async_trait]
impl MessageAnalyzer for NeutralAnalyzer {
    async fn analyze(&self, _text: &str, _context: &AnalysisContext) -> Result<Analysis, AiError> {
        Ok(Analysis::neutral())
    }
}
