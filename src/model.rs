//! Timestep-conditioned network for joint tabular denoising.
//!
//! The concrete [`ConditionalTabularModel`] is an intentionally boring feed-forward
//! network: enough structure to learn the reverse process, without importing a full
//! ML framework. Timestep conditioning is a learned per-step embedding multiplied
//! elementwise into each trunk layer's linear output (gain modulation, not
//! concatenation); a shared trunk feeds a continuous head (noise prediction) and a
//! discrete head (per-feature softmax over the one-hot block).
//!
//! Gradients are hand-derived. Parameters flatten to a single `Array1<f32>` so the
//! optimizer, gradient clipping, and the EMA shadow all operate on one vector.

use crate::layout::FeatureLayout;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

/// The capability the diffusion core depends on: predict continuous noise and a
/// per-feature denoised class distribution, conditioned on per-row timesteps.
pub trait ConditionalDenoiser {
    /// Returns `(continuous_prediction, discrete_distribution)`; the discrete output
    /// is softmax-normalized independently within every feature range of `layout`.
    fn forward(
        &self,
        continuous: &ArrayView2<f32>,
        discrete: &ArrayView2<f32>,
        t: &[usize],
        layout: &FeatureLayout,
    ) -> Result<(Array2<f32>, Array2<f32>)>;
}

#[derive(Debug, Clone)]
struct Dense {
    /// Weights, `(out, in)`.
    w: Array2<f32>,
    b: Array1<f32>,
}

impl Dense {
    fn init(rng: &mut impl Rng, num_in: usize, num_out: usize) -> Self {
        let bound = 1.0 / (num_in as f32).sqrt();
        Self {
            w: Array2::from_shape_simple_fn((num_out, num_in), || {
                rng.random_range(-bound..bound)
            }),
            b: Array1::from_shape_simple_fn(num_out, || rng.random_range(-bound..bound)),
        }
    }

    fn zeros(num_in: usize, num_out: usize) -> Self {
        Self {
            w: Array2::zeros((num_out, num_in)),
            b: Array1::zeros(num_out),
        }
    }

    fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.w.t()) + &self.b
    }

    /// Accumulate parameter gradients and return the gradient w.r.t. the input.
    fn backward(
        &self,
        input: &ArrayView2<f32>,
        d_out: &ArrayView2<f32>,
        grad: &mut Dense,
    ) -> Array2<f32> {
        grad.w += &d_out.t().dot(input);
        grad.b += &d_out.sum_axis(Axis(0));
        d_out.dot(&self.w)
    }
}

/// Linear layer whose output is gain-modulated by a learned timestep embedding.
#[derive(Debug, Clone)]
struct ConditionalDense {
    lin: Dense,
    /// Per-timestep gains, `(num_steps, out)`, initialized uniform in `[0, 1)`.
    embed: Array2<f32>,
}

impl ConditionalDense {
    fn init(rng: &mut impl Rng, num_in: usize, num_out: usize, num_steps: usize) -> Self {
        Self {
            lin: Dense::init(rng, num_in, num_out),
            embed: Array2::from_shape_simple_fn((num_steps, num_out), || rng.random()),
        }
    }

    fn zeros(num_in: usize, num_out: usize, num_steps: usize) -> Self {
        Self {
            lin: Dense::zeros(num_in, num_out),
            embed: Array2::zeros((num_steps, num_out)),
        }
    }

    /// Returns `(pre_gamma, out)`; `pre_gamma` is cached for the backward pass.
    fn forward(&self, x: &ArrayView2<f32>, t: &[usize]) -> (Array2<f32>, Array2<f32>) {
        let pre = self.lin.forward(x);
        let mut out = pre.clone();
        for (i, &ti) in t.iter().enumerate() {
            let gamma = self.embed.row(ti);
            let mut row = out.row_mut(i);
            row *= &gamma;
        }
        (pre, out)
    }

    fn backward(
        &self,
        input: &ArrayView2<f32>,
        pre_gamma: &ArrayView2<f32>,
        t: &[usize],
        d_out: &ArrayView2<f32>,
        grad: &mut ConditionalDense,
    ) -> Array2<f32> {
        let mut d_pre = d_out.to_owned();
        for (i, &ti) in t.iter().enumerate() {
            // d_embed[t_i] += d_out_i ⊙ pre_i; d_pre_i = d_out_i ⊙ gamma_i.
            let gamma = self.embed.row(ti);
            let mut g_row = grad.embed.row_mut(ti);
            for c in 0..gamma.len() {
                g_row[c] += d_out[[i, c]] * pre_gamma[[i, c]];
                d_pre[[i, c]] *= gamma[c];
            }
        }
        self.lin.backward(input, &d_pre.view(), &mut grad.lin)
    }
}

#[inline]
fn softplus(u: f32) -> f32 {
    u.max(0.0) + (1.0 + (-u.abs()).exp()).ln()
}

/// Derivative of softplus from its *output*: sigma(u) = 1 - exp(-softplus(u)).
#[inline]
fn softplus_grad_from_output(h: f32) -> f32 {
    1.0 - (-h).exp()
}

fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Mask an upstream gradient by the ReLU activation pattern (output > 0).
fn relu_backward(d_out: &ArrayView2<f32>, output: &Array2<f32>) -> Array2<f32> {
    let mut d = d_out.to_owned();
    for (dv, &o) in d.iter_mut().zip(output.iter()) {
        if o <= 0.0 {
            *dv = 0.0;
        }
    }
    d
}

/// Intermediate activations cached by [`ConditionalTabularModel::forward_trace`].
pub struct ForwardTrace {
    t: Vec<usize>,
    x: Array2<f32>,
    pre1: Array2<f32>,
    h1: Array2<f32>,
    pre2: Array2<f32>,
    h2: Array2<f32>,
    pre3: Array2<f32>,
    h3: Array2<f32>,
    rd1: Array2<f32>,
    rc1: Array2<f32>,
    rc2: Array2<f32>,
    /// Continuous head output (predicted noise).
    pub out_c: Array2<f32>,
    /// Discrete head output (per-feature softmax distribution).
    pub probs: Array2<f32>,
}

/// Feed-forward tabular denoiser with timestep gain modulation.
#[derive(Debug, Clone)]
pub struct ConditionalTabularModel {
    num_steps: usize,
    hidden_size: usize,
    continuous_size: usize,
    discrete_size: usize,
    lin1: ConditionalDense,
    lin2: ConditionalDense,
    lin3: ConditionalDense,
    lin_d1: Dense,
    lin_d2: Dense,
    lin_c1: Dense,
    lin_c2: Dense,
    lin_c3: Dense,
}

impl ConditionalTabularModel {
    pub fn new(
        rng: &mut impl Rng,
        num_steps: usize,
        hidden_size: usize,
        continuous_size: usize,
        discrete_size: usize,
    ) -> Result<Self> {
        if num_steps == 0 || hidden_size == 0 || continuous_size == 0 || discrete_size == 0 {
            return Err(Error::Domain("model dimensions must all be >= 1"));
        }
        let input = continuous_size + discrete_size;
        Ok(Self {
            num_steps,
            hidden_size,
            continuous_size,
            discrete_size,
            lin1: ConditionalDense::init(rng, input, hidden_size, num_steps),
            lin2: ConditionalDense::init(rng, hidden_size, hidden_size, num_steps),
            lin3: ConditionalDense::init(rng, hidden_size, hidden_size, num_steps),
            lin_d1: Dense::init(rng, hidden_size, hidden_size),
            lin_d2: Dense::init(rng, hidden_size, discrete_size),
            lin_c1: Dense::init(rng, hidden_size, hidden_size),
            lin_c2: Dense::init(rng, hidden_size, hidden_size),
            lin_c3: Dense::init(rng, hidden_size, continuous_size),
        })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn continuous_size(&self) -> usize {
        self.continuous_size
    }

    pub fn discrete_size(&self) -> usize {
        self.discrete_size
    }

    /// Same-shaped container of zeros, used to accumulate gradients.
    pub fn zeros_like(&self) -> Self {
        let input = self.continuous_size + self.discrete_size;
        Self {
            num_steps: self.num_steps,
            hidden_size: self.hidden_size,
            continuous_size: self.continuous_size,
            discrete_size: self.discrete_size,
            lin1: ConditionalDense::zeros(input, self.hidden_size, self.num_steps),
            lin2: ConditionalDense::zeros(self.hidden_size, self.hidden_size, self.num_steps),
            lin3: ConditionalDense::zeros(self.hidden_size, self.hidden_size, self.num_steps),
            lin_d1: Dense::zeros(self.hidden_size, self.hidden_size),
            lin_d2: Dense::zeros(self.hidden_size, self.discrete_size),
            lin_c1: Dense::zeros(self.hidden_size, self.hidden_size),
            lin_c2: Dense::zeros(self.hidden_size, self.hidden_size),
            lin_c3: Dense::zeros(self.hidden_size, self.continuous_size),
        }
    }

    fn validate_inputs(
        &self,
        continuous: &ArrayView2<f32>,
        discrete: &ArrayView2<f32>,
        t: &[usize],
        layout: &FeatureLayout,
    ) -> Result<()> {
        if continuous.ncols() != self.continuous_size {
            return Err(Error::Shape("continuous width must match the model"));
        }
        if discrete.ncols() != self.discrete_size {
            return Err(Error::Shape("discrete width must match the model"));
        }
        if layout.total_width() != self.discrete_size {
            return Err(Error::Shape("layout width must match the discrete block"));
        }
        if continuous.nrows() != discrete.nrows() {
            return Err(Error::Shape("continuous and discrete rows must align"));
        }
        if t.len() != continuous.nrows() {
            return Err(Error::Shape("t must have one timestep per row"));
        }
        if t.iter().any(|&ti| ti >= self.num_steps) {
            return Err(Error::Domain("timestep index out of model range"));
        }
        Ok(())
    }

    /// Forward pass that keeps every intermediate needed by [`Self::backward`].
    pub fn forward_trace(
        &self,
        continuous: &ArrayView2<f32>,
        discrete: &ArrayView2<f32>,
        t: &[usize],
        layout: &FeatureLayout,
    ) -> Result<ForwardTrace> {
        self.validate_inputs(continuous, discrete, t, layout)?;
        let n = continuous.nrows();

        let mut x = Array2::<f32>::zeros((n, self.continuous_size + self.discrete_size));
        x.slice_mut(ndarray::s![.., ..self.continuous_size])
            .assign(continuous);
        x.slice_mut(ndarray::s![.., self.continuous_size..])
            .assign(discrete);

        let (pre1, u1) = self.lin1.forward(&x.view(), t);
        let h1 = u1.mapv(softplus);
        let (pre2, u2) = self.lin2.forward(&h1.view(), t);
        let h2 = u2.mapv(softplus);
        let (pre3, u3) = self.lin3.forward(&h2.view(), t);
        let h3 = u3.mapv(softplus);

        // Discrete head: one hidden layer, then per-feature softmax on the logits.
        let rd1 = relu(&self.lin_d1.forward(&h3.view()));
        let logits = self.lin_d2.forward(&rd1.view());
        let mut probs = Array2::<f32>::zeros((n, self.discrete_size));
        for range in layout.ranges() {
            for i in 0..n {
                let mut max = f32::NEG_INFINITY;
                for c in range.start..range.end {
                    max = max.max(logits[[i, c]]);
                }
                let mut denom = 0.0f32;
                for c in range.start..range.end {
                    let e = (logits[[i, c]] - max).exp();
                    probs[[i, c]] = e;
                    denom += e;
                }
                for c in range.start..range.end {
                    probs[[i, c]] /= denom;
                }
            }
        }

        // Continuous head: two hidden layers, linear output (noise prediction).
        let rc1 = relu(&self.lin_c1.forward(&h3.view()));
        let rc2 = relu(&self.lin_c2.forward(&rc1.view()));
        let out_c = self.lin_c3.forward(&rc2.view());

        Ok(ForwardTrace {
            t: t.to_vec(),
            x,
            pre1,
            h1,
            pre2,
            h2,
            pre3,
            h3,
            rd1,
            rc1,
            rc2,
            out_c,
            probs,
        })
    }

    /// Backpropagate loss gradients w.r.t. both heads' outputs into a parameter
    /// gradient container shaped like the model.
    ///
    /// `d_out_c` is dL/d(continuous prediction); `d_probs` is dL/d(softmax output)
    /// and is pulled through the per-feature softmax Jacobian here.
    pub fn backward(
        &self,
        trace: &ForwardTrace,
        d_out_c: &ArrayView2<f32>,
        d_probs: &ArrayView2<f32>,
        layout: &FeatureLayout,
    ) -> Result<Self> {
        if d_out_c.shape() != trace.out_c.shape() {
            return Err(Error::Shape("d_out_c must match the continuous output"));
        }
        if d_probs.shape() != trace.probs.shape() {
            return Err(Error::Shape("d_probs must match the discrete output"));
        }
        let n = trace.x.nrows();
        let mut grad = self.zeros_like();

        // Softmax Jacobian per feature range: d_logit = s ⊙ (g - <g, s>).
        let mut d_logits = Array2::<f32>::zeros((n, self.discrete_size));
        for range in layout.ranges() {
            for i in 0..n {
                let mut dot = 0.0f32;
                for c in range.start..range.end {
                    dot += d_probs[[i, c]] * trace.probs[[i, c]];
                }
                for c in range.start..range.end {
                    d_logits[[i, c]] = trace.probs[[i, c]] * (d_probs[[i, c]] - dot);
                }
            }
        }

        // Discrete head.
        let d_rd1 = self
            .lin_d2
            .backward(&trace.rd1.view(), &d_logits.view(), &mut grad.lin_d2);
        let d_ad1 = relu_backward(&d_rd1.view(), &trace.rd1);
        let d_h3_d = self
            .lin_d1
            .backward(&trace.h3.view(), &d_ad1.view(), &mut grad.lin_d1);

        // Continuous head.
        let d_rc2 = self
            .lin_c3
            .backward(&trace.rc2.view(), d_out_c, &mut grad.lin_c3);
        let d_ac2 = relu_backward(&d_rc2.view(), &trace.rc2);
        let d_rc1 = self
            .lin_c2
            .backward(&trace.rc1.view(), &d_ac2.view(), &mut grad.lin_c2);
        let d_ac1 = relu_backward(&d_rc1.view(), &trace.rc1);
        let d_h3_c = self
            .lin_c1
            .backward(&trace.h3.view(), &d_ac1.view(), &mut grad.lin_c1);

        // Trunk, deepest layer first, through softplus then gain modulation.
        let d_h3 = d_h3_d + d_h3_c;
        let mut d_u = d_h3;
        for (dv, &h) in d_u.iter_mut().zip(trace.h3.iter()) {
            *dv *= softplus_grad_from_output(h);
        }
        let d_h2 = self.lin3.backward(
            &trace.h2.view(),
            &trace.pre3.view(),
            &trace.t,
            &d_u.view(),
            &mut grad.lin3,
        );

        let mut d_u = d_h2;
        for (dv, &h) in d_u.iter_mut().zip(trace.h2.iter()) {
            *dv *= softplus_grad_from_output(h);
        }
        let d_h1 = self.lin2.backward(
            &trace.h1.view(),
            &trace.pre2.view(),
            &trace.t,
            &d_u.view(),
            &mut grad.lin2,
        );

        let mut d_u = d_h1;
        for (dv, &h) in d_u.iter_mut().zip(trace.h1.iter()) {
            *dv *= softplus_grad_from_output(h);
        }
        let _d_x = self.lin1.backward(
            &trace.x.view(),
            &trace.pre1.view(),
            &trace.t,
            &d_u.view(),
            &mut grad.lin1,
        );

        Ok(grad)
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> usize {
        let cond = |l: &ConditionalDense| l.lin.w.len() + l.lin.b.len() + l.embed.len();
        let dense = |l: &Dense| l.w.len() + l.b.len();
        cond(&self.lin1)
            + cond(&self.lin2)
            + cond(&self.lin3)
            + dense(&self.lin_d1)
            + dense(&self.lin_d2)
            + dense(&self.lin_c1)
            + dense(&self.lin_c2)
            + dense(&self.lin_c3)
    }

    /// Copy all parameters into one flat vector, in a fixed field order.
    pub fn flatten(&self) -> Array1<f32> {
        let mut v = Vec::with_capacity(self.num_params());
        for layer in [&self.lin1, &self.lin2, &self.lin3] {
            v.extend(layer.lin.w.iter().copied());
            v.extend(layer.lin.b.iter().copied());
            v.extend(layer.embed.iter().copied());
        }
        for layer in [
            &self.lin_d1,
            &self.lin_d2,
            &self.lin_c1,
            &self.lin_c2,
            &self.lin_c3,
        ] {
            v.extend(layer.w.iter().copied());
            v.extend(layer.b.iter().copied());
        }
        Array1::from_vec(v)
    }

    /// Overwrite all parameters from a flat vector produced by [`Self::flatten`].
    pub fn unflatten_into(&mut self, flat: &ArrayView1<f32>) -> Result<()> {
        if flat.len() != self.num_params() {
            return Err(Error::Shape("flat vector length must match num_params"));
        }
        let mut off = 0usize;
        for layer in [&mut self.lin1, &mut self.lin2, &mut self.lin3] {
            copy_from_flat(layer.lin.w.iter_mut(), flat, &mut off);
            copy_from_flat(layer.lin.b.iter_mut(), flat, &mut off);
            copy_from_flat(layer.embed.iter_mut(), flat, &mut off);
        }
        for layer in [
            &mut self.lin_d1,
            &mut self.lin_d2,
            &mut self.lin_c1,
            &mut self.lin_c2,
            &mut self.lin_c3,
        ] {
            copy_from_flat(layer.w.iter_mut(), flat, &mut off);
            copy_from_flat(layer.b.iter_mut(), flat, &mut off);
        }
        Ok(())
    }
}

fn copy_from_flat<'a>(
    dst: impl Iterator<Item = &'a mut f32>,
    flat: &ArrayView1<f32>,
    off: &mut usize,
) {
    for p in dst {
        *p = flat[*off];
        *off += 1;
    }
}

impl ConditionalDenoiser for ConditionalTabularModel {
    fn forward(
        &self,
        continuous: &ArrayView2<f32>,
        discrete: &ArrayView2<f32>,
        t: &[usize],
        layout: &FeatureLayout,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let trace = self.forward_trace(continuous, discrete, t, layout)?;
        Ok((trace.out_c, trace.probs))
    }
}
