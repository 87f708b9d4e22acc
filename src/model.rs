//! The hierarchical dual-attention backbone.
//!
//! A configured model is a flat run of [`MultiScaleBlock`]s grouped into
//! stages by an explicit [`StageDescriptor`] table built once at
//! construction. Stage boundaries multiply channel width and head count and
//! halve resolution, either through an inter-stage patch re-embedding or
//! through query pooling inside the first block of the new stage. Outputs can
//! be classification logits, pooled pre-logit features, or a feature pyramid
//! of selected intermediate maps with early-exit traversal.

use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use crate::attention::AttentionType;
use crate::block::{BlockConfig, MultiScaleBlock};
use crate::embed::{PatchEmbed, PosEmbed};
use crate::error::ModelError;

/// How resolution is reduced and width increased at stage boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub enum Downsample {
    /// A strided re-embedding convolution between stages.
    PatchEmbed { overlapped: bool },
    /// Max-pooling applied to the attention queries of the first block of
    /// each stage after the first.
    QueryPool { stride: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub enum PoolType {
    Avg,
    Max,
}

/// Layout of pyramid outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Nchw,
    Nhwc,
}

/// Which intermediate outputs to collect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeatureSelection {
    All,
    LastN(usize),
    Indices(Vec<usize>),
}

/// Whether selection indices refer to stages or to individual blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granularity {
    Stage,
    Block,
}

/// Per-stage metadata, built once from the configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageDescriptor {
    pub stage_id: usize,
    /// Flat `[start, end)` block indices belonging to this stage.
    pub block_range: (usize, usize),
    pub channel_width: usize,
    pub head_count: usize,
    /// Total spatial reduction of this stage's output relative to the input
    /// image.
    pub reduction: usize,
}

/// External recompute primitive: called with a block's pure forward closure
/// and its input, it must return the closure's output. A trainer can use it
/// to drop intermediate activations and regenerate them on the backward pass;
/// the model makes no other use of it.
pub type RecomputeFn<'a> =
    dyn Fn(&dyn Fn(&Tensor) -> Result<Tensor>, &Tensor) -> Result<Tensor> + 'a;

/// Per-call forward options, threaded explicitly through the traversal.
#[derive(Default, Clone, Copy)]
pub struct ForwardOpts<'a> {
    /// Enables stochastic depth on residual branches.
    pub train: bool,
    /// Invoked once per block when set.
    pub recompute: Option<&'a RecomputeFn<'a>>,
}

#[derive(Clone, Debug)]
struct BlockPlan {
    stage: usize,
    local_idx: usize,
    dim: usize,
    dim_out: usize,
    num_heads: usize,
    attention: AttentionType,
    window_size: usize,
    q_stride: Option<usize>,
    drop_path: f64,
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct DaViTConfig {
    pub in_chans: usize,
    /// Depth units per stage; each unit expands to one block per entry of
    /// `attention_types`.
    pub depths: Vec<usize>,
    pub embed_dims: Vec<usize>,
    pub num_heads: Vec<usize>,
    /// Window size per stage. Zero is rejected; global attention is opted
    /// into per block through `global_attn_blocks`.
    pub window_sizes: Vec<usize>,
    /// Flat block indices attending over the whole map instead of windows.
    pub global_attn_blocks: Vec<usize>,
    /// Attention variant cycle within each depth unit.
    pub attention_types: Vec<AttentionType>,
    pub patch_size: usize,
    pub mlp_ratio: f64,
    pub qkv_bias: bool,
    /// Maximum stochastic-depth rate; scheduled linearly over blocks.
    pub drop_path_rate: f64,
    pub cpe_act: bool,
    pub downsample: Downsample,
    /// Seed resolution of the learned absolute position bias, or `None` to
    /// rely on the conv position encodings alone.
    pub pos_embed: Option<(usize, usize)>,
    pub num_classes: usize,
    pub head_hidden_size: Option<usize>,
    pub pool: PoolType,
}

impl DaViTConfig {
    pub fn davit_tiny() -> Self {
        Self {
            in_chans: 3,
            depths: vec![1, 1, 3, 1],
            embed_dims: vec![96, 192, 384, 768],
            num_heads: vec![3, 6, 12, 24],
            window_sizes: vec![7, 7, 7, 7],
            global_attn_blocks: vec![],
            attention_types: vec![AttentionType::Spatial, AttentionType::Channel],
            patch_size: 4,
            mlp_ratio: 4.0,
            qkv_bias: true,
            drop_path_rate: 0.1,
            cpe_act: false,
            downsample: Downsample::PatchEmbed { overlapped: false },
            pos_embed: None,
            num_classes: 1000,
            head_hidden_size: None,
            pool: PoolType::Avg,
        }
    }

    pub fn davit_small() -> Self {
        Self {
            depths: vec![1, 1, 9, 1],
            ..Self::davit_tiny()
        }
    }

    pub fn davit_base() -> Self {
        Self {
            depths: vec![1, 1, 9, 1],
            embed_dims: vec![128, 256, 512, 1024],
            num_heads: vec![4, 8, 16, 32],
            ..Self::davit_tiny()
        }
    }

    /// Query-pooled variant: all-spatial attention, stage transitions realized
    /// inside the first block of each stage, windowed position bias.
    pub fn qpool_tiny() -> Self {
        Self {
            depths: vec![1, 2, 7, 2],
            embed_dims: vec![96, 192, 384, 768],
            num_heads: vec![1, 2, 4, 8],
            window_sizes: vec![8, 4, 14, 7],
            global_attn_blocks: vec![5, 7, 9],
            attention_types: vec![AttentionType::Spatial],
            downsample: Downsample::QueryPool { stride: 2 },
            pos_embed: Some((7, 7)),
            drop_path_rate: 0.0,
            ..Self::davit_tiny()
        }
    }

    pub fn num_stages(&self) -> usize {
        self.depths.len()
    }

    fn blocks_per_stage(&self, stage: usize) -> usize {
        self.depths[stage] * self.attention_types.len()
    }

    pub fn total_blocks(&self) -> usize {
        (0..self.num_stages()).map(|s| self.blocks_per_stage(s)).sum()
    }

    /// Output channels per stage, shallowest first.
    pub fn stage_channels(&self) -> Vec<usize> {
        self.embed_dims.clone()
    }

    pub fn validate(&self) -> std::result::Result<(), ModelError> {
        let n = self.num_stages();
        if n == 0 {
            return Err(ModelError::config("depths must not be empty"));
        }
        if self.embed_dims.len() != n || self.num_heads.len() != n || self.window_sizes.len() != n {
            return Err(ModelError::config(format!(
                "inconsistent stage descriptor lengths: depths={}, embed_dims={}, num_heads={}, window_sizes={}",
                n,
                self.embed_dims.len(),
                self.num_heads.len(),
                self.window_sizes.len()
            )));
        }
        if self.attention_types.is_empty() {
            return Err(ModelError::config("attention_types must not be empty"));
        }
        if self.depths.iter().any(|&d| d == 0) {
            return Err(ModelError::config("every stage needs at least one depth unit"));
        }
        if self.in_chans == 0 {
            return Err(ModelError::config("in_chans must be at least 1"));
        }
        if self.patch_size == 0 {
            return Err(ModelError::config("patch_size must be at least 1"));
        }
        for (s, (&dim, &heads)) in self.embed_dims.iter().zip(&self.num_heads).enumerate() {
            if heads == 0 || dim % heads != 0 {
                return Err(ModelError::config(format!(
                    "stage {s}: embed dim {dim} not divisible by head count {heads}"
                )));
            }
        }
        for (s, &ws) in self.window_sizes.iter().enumerate() {
            if ws == 0 {
                return Err(ModelError::config(format!(
                    "stage {s}: window size 0 is reserved for per-block global attention"
                )));
            }
        }
        for pair in self.embed_dims.windows(2) {
            if pair[1] < pair[0] {
                return Err(ModelError::config(format!(
                    "embed dims must be non-decreasing across stages, got {} after {}",
                    pair[1], pair[0]
                )));
            }
        }
        let total = self.total_blocks();
        for &i in &self.global_attn_blocks {
            if i >= total {
                return Err(ModelError::config(format!(
                    "global attention block index {i} out of range for {total} blocks"
                )));
            }
        }
        if let Downsample::QueryPool { stride } = self.downsample {
            if stride < 2 {
                return Err(ModelError::config(format!(
                    "query pool stride must be at least 2, got {stride}"
                )));
            }
            if self.attention_types[0] != AttentionType::Spatial {
                return Err(ModelError::config(
                    "query pooling requires stage-opening blocks to use spatial attention",
                ));
            }
        }
        Ok(())
    }

    fn block_plans(&self) -> std::result::Result<(Vec<StageDescriptor>, Vec<BlockPlan>), ModelError> {
        self.validate()?;

        let mut descriptors = Vec::with_capacity(self.num_stages());
        let mut plans = Vec::with_capacity(self.total_blocks());
        let total = self.total_blocks();
        let cycle = self.attention_types.len();

        let mut flat = 0usize;
        for s in 0..self.num_stages() {
            let count = self.blocks_per_stage(s);
            descriptors.push(StageDescriptor {
                stage_id: s,
                block_range: (flat, flat + count),
                channel_width: self.embed_dims[s],
                head_count: self.num_heads[s],
                reduction: self.patch_size << s,
            });

            for j in 0..count {
                let is_transition = s > 0 && j == 0;
                let (dim, q_stride, lagged_stage) = match self.downsample {
                    Downsample::QueryPool { stride } if is_transition => {
                        // The opening block of a stage keeps the previous
                        // stage's window size; cross-check against reference
                        // outputs before changing this.
                        (self.embed_dims[s - 1], Some(stride), s - 1)
                    }
                    _ => (self.embed_dims[s], None, s),
                };
                let window_size = if self.global_attn_blocks.contains(&flat) {
                    0
                } else {
                    self.window_sizes[lagged_stage]
                };
                if let Some(stride) = q_stride {
                    if window_size > 0 && window_size % stride != 0 {
                        return Err(ModelError::config(format!(
                            "block {flat}: window size {window_size} not divisible by query pool stride {stride}"
                        )));
                    }
                }
                let drop_path = if total > 1 {
                    self.drop_path_rate * flat as f64 / (total - 1) as f64
                } else {
                    0.0
                };
                plans.push(BlockPlan {
                    stage: s,
                    local_idx: j,
                    dim,
                    dim_out: self.embed_dims[s],
                    num_heads: self.num_heads[s],
                    attention: self.attention_types[j % cycle],
                    window_size,
                    q_stride,
                    drop_path,
                });
                flat += 1;
            }
        }

        Ok((descriptors, plans))
    }

    /// Canonical parameter name/shape table, matching the `VarBuilder` paths
    /// used at construction. External checkpoint loaders can remap legacy
    /// naming schemes against this table with a pure string rewrite, without
    /// any knowledge of the model internals.
    pub fn parameter_table(&self) -> std::result::Result<Vec<(String, Vec<usize>)>, ModelError> {
        let (_, plans) = self.block_plans()?;
        let mut table: Vec<(String, Vec<usize>)> = Vec::new();

        let linear = |t: &mut Vec<(String, Vec<usize>)>, name: String, inp: usize, out: usize, bias: bool| {
            t.push((format!("{name}.weight"), vec![out, inp]));
            if bias {
                t.push((format!("{name}.bias"), vec![out]));
            }
        };
        let norm = |t: &mut Vec<(String, Vec<usize>)>, name: String, dim: usize| {
            t.push((format!("{name}.weight"), vec![dim]));
            t.push((format!("{name}.bias"), vec![dim]));
        };

        // patch embeds
        table.push((
            "patch_embeds.0.proj.weight".into(),
            vec![self.embed_dims[0], self.in_chans, 7, 7],
        ));
        table.push(("patch_embeds.0.proj.bias".into(), vec![self.embed_dims[0]]));
        norm(&mut table, "patch_embeds.0.norm".into(), self.embed_dims[0]);
        if let Downsample::PatchEmbed { overlapped } = self.downsample {
            let k = if overlapped { 3 } else { 2 };
            for s in 1..self.num_stages() {
                table.push((
                    format!("patch_embeds.{s}.proj.weight"),
                    vec![self.embed_dims[s], self.embed_dims[s - 1], k, k],
                ));
                table.push((format!("patch_embeds.{s}.proj.bias"), vec![self.embed_dims[s]]));
                norm(&mut table, format!("patch_embeds.{s}.norm"), self.embed_dims[s - 1]);
            }
        }

        if let Some((gh, gw)) = self.pos_embed {
            table.push(("pos_embed".into(), vec![1, self.embed_dims[0], gh, gw]));
            let ws = self.window_sizes[0];
            table.push(("pos_embed_window".into(), vec![1, self.embed_dims[0], ws, ws]));
        }

        for plan in &plans {
            let p = format!("stages.stage_{}.blocks.{}", plan.stage, plan.local_idx);
            table.push((format!("{p}.cpe.0.proj.weight"), vec![plan.dim, 1, 3, 3]));
            table.push((format!("{p}.cpe.0.proj.bias"), vec![plan.dim]));
            norm(&mut table, format!("{p}.norm1"), plan.dim);
            linear(&mut table, format!("{p}.attn.qkv"), plan.dim, plan.dim_out * 3, self.qkv_bias);
            linear(&mut table, format!("{p}.attn.proj"), plan.dim_out, plan.dim_out, true);
            if plan.dim != plan.dim_out {
                linear(&mut table, format!("{p}.proj"), plan.dim, plan.dim_out, true);
            }
            table.push((format!("{p}.cpe.1.proj.weight"), vec![plan.dim_out, 1, 3, 3]));
            table.push((format!("{p}.cpe.1.proj.bias"), vec![plan.dim_out]));
            norm(&mut table, format!("{p}.norm2"), plan.dim_out);
            let hidden = (plan.dim_out as f64 * self.mlp_ratio) as usize;
            linear(&mut table, format!("{p}.mlp.fc1"), plan.dim_out, hidden, true);
            linear(&mut table, format!("{p}.mlp.fc2"), hidden, plan.dim_out, true);
        }

        let last = *self.embed_dims.last().unwrap();
        norm(&mut table, "norm".into(), last);
        let mut fc_in = last;
        if let Some(hidden) = self.head_hidden_size {
            linear(&mut table, "head.pre_logits".into(), last, hidden, true);
            fc_in = hidden;
        }
        if self.num_classes > 0 {
            linear(&mut table, "head.fc".into(), fc_in, self.num_classes, true);
        }

        Ok(table)
    }
}

/// Terminal pooling + projection.
pub struct ClassifierHead {
    pre_logits: Option<Linear>,
    fc: Option<Linear>,
    pool: PoolType,
}

impl ClassifierHead {
    pub fn new(
        in_dim: usize,
        num_classes: usize,
        hidden: Option<usize>,
        pool: PoolType,
        vb: VarBuilder,
    ) -> Result<Self> {
        let pre_logits = match hidden {
            Some(h) => Some(candle_nn::linear(in_dim, h, vb.pp("pre_logits"))?),
            None => None,
        };
        let fc_in = hidden.unwrap_or(in_dim);
        let fc = if num_classes > 0 {
            Some(candle_nn::linear(fc_in, num_classes, vb.pp("fc"))?)
        } else {
            None
        };
        Ok(Self {
            pre_logits,
            fc,
            pool,
        })
    }

    /// Pool a `(B, H, W, C)` map over its spatial axes and project. With
    /// `pre_logits` set (or no classifier configured) the pooled features are
    /// returned instead of logits.
    pub fn forward(&self, x: &Tensor, pre_logits: bool) -> Result<Tensor> {
        let (b, h, w, c) = x.dims4()?;
        let tokens = x.reshape((b, h * w, c))?;
        let mut x = match self.pool {
            PoolType::Avg => tokens.mean(1)?,
            PoolType::Max => tokens.max(1)?,
        };
        if let Some(proj) = &self.pre_logits {
            x = proj.forward(&x)?.gelu_erf()?;
        }
        match (&self.fc, pre_logits) {
            (Some(fc), false) => fc.forward(&x),
            _ => Ok(x),
        }
    }
}

/// Hierarchical dual-attention backbone.
pub struct DaViT {
    patch_embeds: Vec<PatchEmbed>,
    pos_embed: Option<PosEmbed>,
    blocks: Vec<MultiScaleBlock>,
    descriptors: Vec<StageDescriptor>,
    norm: LayerNorm,
    head: ClassifierHead,
    config: DaViTConfig,
}

impl DaViT {
    pub fn new(config: DaViTConfig, vb: VarBuilder) -> Result<Self> {
        let (descriptors, plans) = config.block_plans()?;

        let mut patch_embeds = vec![PatchEmbed::initial(
            config.in_chans,
            config.embed_dims[0],
            config.patch_size,
            vb.pp("patch_embeds.0"),
        )?];
        if let Downsample::PatchEmbed { overlapped } = config.downsample {
            for s in 1..config.num_stages() {
                patch_embeds.push(PatchEmbed::transition(
                    config.embed_dims[s - 1],
                    config.embed_dims[s],
                    overlapped,
                    vb.pp(format!("patch_embeds.{s}")),
                )?);
            }
        }

        let pos_embed = match config.pos_embed {
            Some(global_size) => Some(PosEmbed::new(
                config.embed_dims[0],
                global_size,
                config.window_sizes[0],
                vb.clone(),
            )?),
            None => None,
        };

        let mut blocks = Vec::with_capacity(plans.len());
        for plan in &plans {
            let block = MultiScaleBlock::new(
                BlockConfig {
                    dim: plan.dim,
                    dim_out: plan.dim_out,
                    num_heads: plan.num_heads,
                    attention: plan.attention,
                    window_size: plan.window_size,
                    q_stride: plan.q_stride,
                    mlp_ratio: config.mlp_ratio,
                    qkv_bias: config.qkv_bias,
                    drop_path: plan.drop_path,
                    cpe_act: config.cpe_act,
                },
                vb.pp(format!("stages.stage_{}.blocks.{}", plan.stage, plan.local_idx)),
            )?;
            blocks.push(block);
        }

        let last_dim = *config.embed_dims.last().unwrap();
        let norm = candle_nn::layer_norm(last_dim, 1e-5, vb.pp("norm"))?;
        let head = ClassifierHead::new(
            last_dim,
            config.num_classes,
            config.head_hidden_size,
            config.pool,
            vb.pp("head"),
        )?;

        log::debug!(
            "built model: {} stages, {} blocks, stage channels {:?}",
            descriptors.len(),
            blocks.len(),
            config.embed_dims,
        );

        Ok(Self {
            patch_embeds,
            pos_embed,
            blocks,
            descriptors,
            norm,
            head,
            config,
        })
    }

    pub fn config(&self) -> &DaViTConfig {
        &self.config
    }

    /// Per-stage channel/reduction metadata for downstream consumers.
    pub fn stage_info(&self) -> &[StageDescriptor] {
        &self.descriptors
    }

    /// Flat indices of the last block of each stage.
    pub fn stage_ends(&self) -> Vec<usize> {
        self.descriptors.iter().map(|d| d.block_range.1 - 1).collect()
    }

    /// Resolve a feature selection into sorted flat block indices plus the
    /// highest block that must run; traversal stops there, so requesting only
    /// early features skips the rest of the network.
    pub fn pyramid_plan(
        &self,
        selection: &FeatureSelection,
        granularity: Granularity,
    ) -> std::result::Result<(Vec<usize>, usize), ModelError> {
        let (available, granularity_name) = match granularity {
            Granularity::Stage => (self.descriptors.len(), "stage"),
            Granularity::Block => (self.blocks.len(), "block"),
        };

        let indices: Vec<usize> = match selection {
            FeatureSelection::All => (0..available).collect(),
            FeatureSelection::LastN(n) => {
                if *n > available || *n == 0 {
                    return Err(ModelError::Selection {
                        index: *n,
                        available,
                        granularity: granularity_name,
                    });
                }
                (available - n..available).collect()
            }
            FeatureSelection::Indices(list) => {
                if list.is_empty() {
                    return Err(ModelError::Selection {
                        index: 0,
                        available,
                        granularity: granularity_name,
                    });
                }
                for &i in list {
                    if i >= available {
                        return Err(ModelError::Selection {
                            index: i,
                            available,
                            granularity: granularity_name,
                        });
                    }
                }
                let mut v = list.clone();
                v.sort_unstable();
                v.dedup();
                v
            }
        };

        let flat: Vec<usize> = match granularity {
            Granularity::Stage => {
                let ends = self.stage_ends();
                indices.iter().map(|&i| ends[i]).collect()
            }
            Granularity::Block => indices,
        };
        let max_index = *flat.last().expect("selection is never empty");
        Ok((flat, max_index))
    }

    fn run_block(
        &self,
        block: &MultiScaleBlock,
        x: &Tensor,
        opts: &ForwardOpts,
    ) -> Result<Tensor> {
        match opts.recompute {
            Some(recompute) => {
                let f = |t: &Tensor| block.forward(t, opts.train);
                recompute(&f, x)
            }
            None => block.forward(x, opts.train),
        }
    }

    /// Run the embed + block pipeline up to `max_block` (inclusive),
    /// collecting the output of every block listed in `take` into `outs`.
    /// Returns the last computed map in `(B, H, W, C)` layout.
    fn forward_network(
        &self,
        x: &Tensor,
        max_block: Option<usize>,
        take: &[usize],
        fmt: OutputFormat,
        outs: &mut Vec<Tensor>,
        opts: &ForwardOpts,
    ) -> Result<Tensor> {
        let (_, c, _, _) = x.dims4()?;
        if c != self.config.in_chans {
            return Err(ModelError::shape(
                "model input",
                format!("{} channels", self.config.in_chans),
                format!("{c} channels"),
            )
            .into());
        }

        let (mut x, _) = self.patch_embeds[0].forward(x)?;
        if let Some(pos) = &self.pos_embed {
            x = pos.forward(&x)?;
        }

        let limit = max_block.unwrap_or(self.blocks.len() - 1);
        let mut stage = 0usize;
        for (i, block) in self.blocks.iter().enumerate().take(limit + 1) {
            // advance to the next stage, re-embedding when configured
            if i >= self.descriptors[stage].block_range.1 {
                stage += 1;
                if self.patch_embeds.len() > 1 {
                    let (embedded, _) = self.patch_embeds[stage].forward(&x)?;
                    x = embedded;
                }
            }
            x = self.run_block(block, &x, opts)?;
            if take.contains(&i) {
                let out = match fmt {
                    OutputFormat::Nhwc => x.clone(),
                    OutputFormat::Nchw => x.permute((0, 3, 1, 2))?.contiguous()?,
                };
                outs.push(out);
            }
        }
        Ok(x)
    }

    /// Ordered multi-scale feature maps for the selected stage or block
    /// outputs. Entries come shallowest first, with non-decreasing channel
    /// count and non-increasing resolution; traversal exits early once the
    /// deepest requested output is produced.
    pub fn forward_pyramid(
        &self,
        x: &Tensor,
        selection: &FeatureSelection,
        granularity: Granularity,
        fmt: OutputFormat,
        opts: &ForwardOpts,
    ) -> Result<Vec<Tensor>> {
        let (take, max_index) = self.pyramid_plan(selection, granularity)?;
        log::trace!("pyramid traversal: take {take:?}, stopping after block {max_index}");
        let mut outs = Vec::with_capacity(take.len());
        self.forward_network(x, Some(max_index), &take, fmt, &mut outs, opts)?;
        Ok(outs)
    }

    /// Final stage output, normalized, in `(B, C, H, W)` layout.
    pub fn forward_features(&self, x: &Tensor, opts: &ForwardOpts) -> Result<Tensor> {
        let x = self.forward_network(x, None, &[], OutputFormat::Nhwc, &mut Vec::new(), opts)?;
        let x = self.norm.forward(&x)?;
        x.permute((0, 3, 1, 2))?.contiguous()
    }

    /// Pool a `(B, C, H, W)` feature map and project to logits, or to pooled
    /// pre-logit features when `pre_logits` is set.
    pub fn forward_head(&self, features: &Tensor, pre_logits: bool) -> Result<Tensor> {
        let x = features.permute((0, 2, 3, 1))?.contiguous()?;
        self.head.forward(&x, pre_logits)
    }

    pub fn forward_with(&self, x: &Tensor, opts: &ForwardOpts) -> Result<Tensor> {
        let features = self.forward_features(x, opts)?;
        self.forward_head(&features, false)
    }

    /// Inference forward pass to classification logits.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_with(x, &ForwardOpts::default())
    }
}
