use candle_core::{DType, Device, Tensor, Var};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    SeedableRng,
};

use crate::{
    config::{Activation, ModelSpec},
    TrainingError,
};

pub trait TrainableModel: Send + Sync {
    fn forward(&self, inputs: &Tensor, train: bool) -> candle_core::Result<Tensor>;

    fn parameters(&self) -> Vec<(String, Var)>;

    fn regularization_loss(&self) -> candle_core::Result<Option<Tensor>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct LinearModel {
    weight: Var,
    bias: Var,
    activation: Activation,
    l2: f64,
}

impl LinearModel {
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        activation: Activation,
        seed: u64,
        device: &Device,
    ) -> Result<Self, TrainingError> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TrainingError::initialization(
                "linear model dimensions must be greater than zero",
            ));
        }
        let limit = (6.0 / (input_dim + output_dim) as f64).sqrt() as f32;
        let dist = Uniform::new_inclusive(-limit, limit);
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<f32> = (0..input_dim * output_dim)
            .map(|_| dist.sample(&mut rng))
            .collect();

        let weight = Tensor::from_vec(values, (input_dim, output_dim), device)
            .map_err(to_init_error)?;
        let bias = Tensor::zeros(output_dim, DType::F32, device).map_err(to_init_error)?;
        Self::from_tensors(weight, bias, activation)
    }

    pub fn from_spec(spec: &ModelSpec, seed: u64, device: &Device) -> Result<Self, TrainingError> {
        Ok(Self::new(spec.input_dim, spec.output_dim, spec.activation, seed, device)?
            .with_l2(spec.l2))
    }

    pub fn from_tensors(
        weight: Tensor,
        bias: Tensor,
        activation: Activation,
    ) -> Result<Self, TrainingError> {
        let (_, output_dim) = weight.dims2().map_err(to_init_error)?;
        if bias.dims() != [output_dim] {
            return Err(TrainingError::initialization(format!(
                "bias shape {:?} does not match weight output dimension {}",
                bias.dims(),
                output_dim
            )));
        }
        Ok(Self {
            weight: Var::from_tensor(&weight).map_err(to_init_error)?,
            bias: Var::from_tensor(&bias).map_err(to_init_error)?,
            activation,
            l2: 0.0,
        })
    }

    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn bias(&self) -> &Tensor {
        self.bias.as_tensor()
    }
}

impl TrainableModel for LinearModel {
    fn forward(&self, inputs: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        let (input_dim, output_dim) = self.weight.as_tensor().dims2()?;
        let dims = inputs.dims().to_vec();
        let rows: usize = dims[..dims.len().saturating_sub(1)].iter().product();

        let flat = inputs.reshape((rows, input_dim))?;
        let projected = flat
            .matmul(self.weight.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?;

        let mut out_dims = dims;
        if let Some(last) = out_dims.last_mut() {
            *last = output_dim;
        }
        let projected = projected.reshape(out_dims)?;

        match self.activation {
            Activation::Identity => Ok(projected),
            // log(1 + e^x)
            Activation::Softplus => projected.exp()?.affine(1.0, 1.0)?.log(),
            Activation::Sigmoid => projected.neg()?.exp()?.affine(1.0, 1.0)?.recip(),
        }
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }

    fn regularization_loss(&self) -> candle_core::Result<Option<Tensor>> {
        if self.l2 == 0.0 {
            return Ok(None);
        }
        let penalty = self.weight.as_tensor().sqr()?.sum_all()?.affine(self.l2, 0.0)?;
        Ok(Some(penalty))
    }
}

fn to_init_error(err: candle_core::Error) -> TrainingError {
    TrainingError::initialization(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(activation: Activation) -> LinearModel {
        let weight = Tensor::new(&[[1.0f32, -1.0], [2.0, 0.5]], &Device::Cpu).unwrap();
        let bias = Tensor::new(&[0.5f32, 0.0], &Device::Cpu).unwrap();
        LinearModel::from_tensors(weight, bias, activation).unwrap()
    }

    #[test]
    fn forward_projects_last_axis() {
        let inputs = Tensor::new(&[[1.0f32, 1.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let out = model(Activation::Identity).forward(&inputs, true).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![3.5, -0.5], vec![4.5, 1.0]]);

        let seq = inputs.reshape((1, 2, 2)).unwrap();
        let out = model(Activation::Identity).forward(&seq, false).unwrap();
        assert_eq!(out.dims(), &[1, 2, 2]);
    }

    #[test]
    fn softplus_outputs_are_positive() {
        let inputs = Tensor::new(&[[-5.0f32, -5.0]], &Device::Cpu).unwrap();
        let out = model(Activation::Softplus).forward(&inputs, true).unwrap();
        assert!(out.flatten_all().unwrap().to_vec1::<f32>().unwrap().iter().all(|v| *v > 0.0));
    }

    #[test]
    fn l2_penalty_scales_weight_norm() {
        let model = model(Activation::Identity).with_l2(0.1);
        let penalty = model.regularization_loss().unwrap().unwrap();
        // 0.1 * (1 + 1 + 4 + 0.25)
        assert!((penalty.to_vec0::<f32>().unwrap() - 0.625).abs() < 1e-6);
    }

    #[test]
    fn seeded_construction_is_reproducible() {
        let a = LinearModel::new(3, 2, Activation::Identity, 9, &Device::Cpu).unwrap();
        let b = LinearModel::new(3, 2, Activation::Identity, 9, &Device::Cpu).unwrap();
        assert_eq!(
            a.weight().to_vec2::<f32>().unwrap(),
            b.weight().to_vec2::<f32>().unwrap()
        );
        assert_eq!(a.parameters().len(), 2);
    }
}
