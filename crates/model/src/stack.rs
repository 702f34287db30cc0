use attention::DecodeState;
use candle_core::Tensor;

use crate::block::MultiHeadAttentionBlock;
use crate::config::StackConfig;
use crate::error::ModelError;

/// Ordered self-attention blocks sharing one `embed_dim`.
#[derive(Debug)]
pub struct AttentionStack {
    blocks: Vec<MultiHeadAttentionBlock>,
}

impl AttentionStack {
    pub fn new(blocks: Vec<MultiHeadAttentionBlock>) -> Result<Self, ModelError> {
        let Some(first) = blocks.first() else {
            return Err(ModelError::InvalidConfig(
                "attention stack needs at least one block".into(),
            ));
        };
        let embed_dim = first.embed_dim();
        if let Some((index, block)) = blocks
            .iter()
            .enumerate()
            .find(|(_, block)| block.embed_dim() != embed_dim)
        {
            return Err(ModelError::InvalidConfig(format!(
                "block {index} has embed_dim {} but the stack uses {embed_dim}",
                block.embed_dim()
            )));
        }
        Ok(Self { blocks })
    }

    /// Builds `num_layers` freshly initialised blocks.
    pub fn from_config(config: &StackConfig) -> Result<Self, ModelError> {
        config.validate()?;
        let blocks = (0..config.num_layers)
            .map(|_| MultiHeadAttentionBlock::with_init(config.block.clone(), &config.init, None))
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!("attention stack: {} layers", blocks.len());
        Self::new(blocks)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn embed_dim(&self) -> usize {
        self.blocks.first().map_or(0, MultiHeadAttentionBlock::embed_dim)
    }

    pub fn blocks(&self) -> &[MultiHeadAttentionBlock] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [MultiHeadAttentionBlock] {
        &mut self.blocks
    }

    /// Runs every block in order with `q = k = v = hidden`.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor, ModelError> {
        let mut hidden = hidden.clone();
        for block in &self.blocks {
            hidden = block.forward(&hidden, &hidden, &hidden)?;
        }
        Ok(hidden)
    }

    /// One zeroed [`DecodeState`] per block.
    pub fn new_decode_states(&self, batch: usize) -> Vec<DecodeState> {
        self.blocks
            .iter()
            .map(|block| block.new_decode_state(batch))
            .collect()
    }

    /// Advances every block's state by the positions in `hidden`.
    ///
    /// Either all states absorb the chunk or none do; on error `states` is
    /// left as it was and the same chunk can be retried.
    pub fn decode_step(
        &self,
        states: &mut [DecodeState],
        hidden: &Tensor,
    ) -> Result<Tensor, ModelError> {
        if states.len() != self.blocks.len() {
            return Err(ModelError::InvalidInput(format!(
                "expected {} decode states, got {}",
                self.blocks.len(),
                states.len()
            )));
        }
        if let Some((index, block)) = self
            .blocks
            .iter()
            .enumerate()
            .find(|(_, block)| !block.path().is_causal())
        {
            return Err(ModelError::InvalidInput(format!(
                "block {index} uses the {} path and cannot decode incrementally",
                block.path()
            )));
        }

        let mut staged = states.to_vec();
        let mut hidden = hidden.clone();
        for (block, state) in self.blocks.iter().zip(staged.iter_mut()) {
            hidden = block.decode_step(state, &hidden, &hidden, &hidden)?;
        }
        states.clone_from_slice(&staged);
        Ok(hidden)
    }
}
