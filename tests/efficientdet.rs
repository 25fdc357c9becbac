use burn::{
    backend::{Autodiff, NdArray, ndarray::NdArrayDevice},
    prelude::*,
    tensor::Distribution,
};
use rust_efficientdet::{
    ConfigError, DetectorInput, DetectorOutput, EfficientDetConfig, anchors::Anchors,
    debug::non_finite_count,
};

type B = Autodiff<NdArray<f32>>;

#[test]
fn invalid_configs_are_rejected() {
    let device = NdArrayDevice::default();

    let err = EfficientDetConfig::new(8).init::<B>(&device).unwrap_err();
    assert_eq!(err, ConfigError::InvalidCoefficient(8));

    let err = EfficientDetConfig::new(0)
        .with_num_classes(0)
        .init::<B>(&device)
        .unwrap_err();
    assert_eq!(err, ConfigError::NoClasses);
}

#[test]
fn loss_backpropagates_to_fusion_weights() {
    let device = NdArrayDevice::default();
    B::seed(42);

    let model = EfficientDetConfig::new(0)
        .with_num_classes(2)
        .init::<B>(&device)
        .unwrap();

    let images = Tensor::<B, 4>::random([2, 3, 64, 64], Distribution::Default, &device);
    let annotations = Tensor::<B, 3>::from_floats(
        [
            [[8.0, 8.0, 40.0, 40.0, 1.0], [-1.0, -1.0, -1.0, -1.0, -1.0]],
            [[0.0, 16.0, 32.0, 48.0, 0.0], [30.0, 30.0, 60.0, 62.0, 1.0]],
        ],
        &device,
    );

    let DetectorOutput::Loss(loss) = model.forward(DetectorInput::Training {
        images,
        annotations,
    }) else {
        panic!("training input must produce a loss");
    };

    let total = loss.total();
    assert_eq!(non_finite_count(total.clone()), 0);

    let grads = total.backward();

    for block in model.bifpn() {
        for node in block.nodes() {
            let grad = node
                .weights
                .val()
                .grad(&grads)
                .expect("every fusion weight takes part in the loss");
            assert_eq!(grad.dims(), [node.arity()]);
            assert_eq!(non_finite_count(grad), 0);
        }
    }
}

#[test]
fn inference_shapes_are_consistent() {
    let device = NdArrayDevice::default();
    B::seed(42);

    let model = EfficientDetConfig::new(0)
        .with_num_classes(5)
        .init::<B>(&device)
        .unwrap();

    let images = Tensor::<B, 4>::random([1, 3, 96, 160], Distribution::Default, &device);
    let heads = model.forward_heads(images.clone());

    let total = Anchors::default().count(96, 160);
    assert_eq!(heads.classification.dims(), [1, total, 5]);
    assert_eq!(heads.regression.dims(), [1, total, 4]);

    let detections = model.detect(images);
    let count = detections.len();
    assert_eq!(detections.classes.dims(), [count]);
    assert_eq!(detections.boxes.dims(), [count, 4]);
}
