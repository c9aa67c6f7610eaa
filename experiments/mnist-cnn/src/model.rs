use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{
        activation::{log_softmax, relu},
        backend::Backend,
        Tensor,
    },
};

use crate::data::IMAGE_SIDE;

const CONV1_CHANNELS: usize = 32;
const CONV2_CHANNELS: usize = 64;
/// Spatial side after two 2x2 poolings.
const POOLED_SIDE: usize = IMAGE_SIDE / 4;
pub const FLATTENED_FEATURES: usize = CONV2_CHANNELS * POOLED_SIDE * POOLED_SIDE;

#[derive(Config, Debug)]
pub struct CnnModelConfig {
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 128)]
    pub hidden_size: usize,
}

/// Two conv/pool stages followed by two fully connected layers, producing log-probabilities.
#[derive(Module, Debug)]
pub struct CnnModel<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
}

/// One row of the model summary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerInfo {
    pub name: &'static str,
    pub kind: &'static str,
    pub params: usize,
}

impl CnnModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CnnModel<B> {
        let padding = PaddingConfig2d::Explicit(1, 1);

        CnnModel {
            conv1: Conv2dConfig::new([1, CONV1_CHANNELS], [3, 3])
                .with_padding(padding.clone())
                .init(device),
            conv2: Conv2dConfig::new([CONV1_CHANNELS, CONV2_CHANNELS], [3, 3])
                .with_padding(padding)
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(FLATTENED_FEATURES, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
        }
    }
}

impl<B: Backend> CnnModel<B> {
    /// `[batch, 1, 28, 28]` images to `[batch, classes]` log-probabilities.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(relu(self.conv1.forward(images)));
        let x = self.pool.forward(relu(self.conv2.forward(x)));

        let [batch_size, channels, height, width] = x.dims();
        let x = x.reshape([batch_size, channels * height * width]);

        let x = relu(self.fc1.forward(x));
        log_softmax(self.fc2.forward(x), 1)
    }

    /// Layers in registration order with their parameter counts.
    pub fn layers(&self) -> Vec<LayerInfo> {
        vec![
            LayerInfo {
                name: "conv1",
                kind: "Conv2d",
                params: self.conv1.num_params(),
            },
            LayerInfo {
                name: "conv2",
                kind: "Conv2d",
                params: self.conv2.num_params(),
            },
            LayerInfo {
                name: "pool",
                kind: "MaxPool2d",
                params: 0,
            },
            LayerInfo {
                name: "fc1",
                kind: "Linear",
                params: self.fc1.num_params(),
            },
            LayerInfo {
                name: "fc2",
                kind: "Linear",
                params: self.fc2.num_params(),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::NUM_CLASSES;
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn flattened_width_matches_pooling() {
        assert_eq!(FLATTENED_FEATURES, 3136);
    }

    #[test]
    fn output_is_a_log_distribution_per_image() {
        let device = NdArrayDevice::Cpu;
        let model = CnnModelConfig::new().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random(
            [3, 1, IMAGE_SIDE, IMAGE_SIDE],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        let output = model.forward(images);
        assert_eq!(output.dims(), [3, NUM_CLASSES]);

        let row_sums = output
            .exp()
            .sum_dim(1)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        for sum in row_sums {
            assert!((sum - 1.0).abs() < 1e-4, "row sums to {sum}");
        }
    }

    #[test]
    fn parameter_counts_per_layer() {
        let model = CnnModelConfig::new().init::<TestBackend>(&NdArrayDevice::Cpu);
        let params: Vec<usize> = model.layers().iter().map(|layer| layer.params).collect();

        assert_eq!(params, vec![320, 18_496, 0, 401_536, 1_290]);
        assert_eq!(model.num_params(), 421_642);
    }
}
