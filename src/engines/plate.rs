//! License-plate engine placeholder
//!
//! Keeps the engine set modular and the `ENGINES` token reserved until a
//! provider is wired in.
//! TODO: replace with a real ANPR provider adapter once one is selected.

use crate::engines::Engine;
use crate::error::Result;
use crate::model::AnalyticEvent;
use async_trait::async_trait;

pub struct PlateStub;

#[async_trait]
impl Engine for PlateStub {
    fn name(&self) -> &str {
        "plater"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn process(&self, _event: AnalyticEvent) -> Result<Vec<AnalyticEvent>> {
        Ok(Vec::new())
    }
}
