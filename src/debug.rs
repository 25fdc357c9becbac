use burn::{
    prelude::Backend,
    tensor::{Tensor, cast::ToElement},
};
use num::Float;

/// Panics with the offending tensors printed if `$a` contains a NaN value.
#[macro_export]
macro_rules! check_nan {
    ($a:expr $(, $rest:expr)*) => {{
        use burn::tensor::cast::ToElement;
        if $a.clone().is_nan().int().sum().into_scalar().to_i32() > 0 {
            println!("A = {}", $a);
            $(println!("{} = {}", stringify!($rest), $rest);)*
            panic!("found nan in line {}", line!());
        }
    }};
}

/// Counts the NaN and infinite values of a tensor.
pub fn non_finite_count<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> usize {
    let nan = tensor.clone().is_nan().int().sum().into_scalar().to_i64();
    let inf = tensor.is_inf().int().sum().into_scalar().to_i64();

    (nan + inf) as usize
}

// Helper function for comparing floats
pub fn assert_approx_eq<F>(a: &F, b: &F, epsilon: F)
where
    F: Float + std::fmt::Display + std::fmt::Debug,
{
    assert!(
        (*a - *b).abs() <= epsilon,
        "Values differ: {:?} vs {:?} (tolerance: {:?})",
        *a,
        *b,
        epsilon
    );
}
