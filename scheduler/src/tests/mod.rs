mod support;

mod endpoint_tests;
mod oversubscription_tests;
mod pool_tests;
mod subset_tests;
