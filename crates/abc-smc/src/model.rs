use abc_core::{AbcError, Model, Parameter, RngHandle, SumStats};

type SimulateFn<O> = dyn Fn(&Parameter, &mut RngHandle) -> Result<O, AbcError> + Send + Sync;
type ReduceFn<O> = dyn Fn(O) -> Result<SumStats, AbcError> + Send + Sync;

/// Model built from closures, producing raw output of type `O`.
pub struct FunctionModel<O = SumStats> {
    name: String,
    simulate: Box<SimulateFn<O>>,
    reduce: Box<ReduceFn<O>>,
}

impl FunctionModel<SumStats> {
    /// Model whose simulator output already is the summary statistics.
    pub fn new<F>(name: impl Into<String>, simulate: F) -> Self
    where
        F: Fn(&Parameter, &mut RngHandle) -> Result<SumStats, AbcError> + Send + Sync + 'static,
    {
        Self::with_reducer(name, simulate, Ok)
    }
}

impl<O> FunctionModel<O> {
    /// Model with a separate reducer from raw output to summary statistics.
    pub fn with_reducer<F, G>(name: impl Into<String>, simulate: F, reduce: G) -> Self
    where
        F: Fn(&Parameter, &mut RngHandle) -> Result<O, AbcError> + Send + Sync + 'static,
        G: Fn(O) -> Result<SumStats, AbcError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            simulate: Box::new(simulate),
            reduce: Box::new(reduce),
        }
    }
}

impl<O> Model for FunctionModel<O> {
    type Output = O;

    fn name(&self) -> &str {
        &self.name
    }

    fn simulate(&self, parameter: &Parameter, rng: &mut RngHandle) -> Result<O, AbcError> {
        (self.simulate)(parameter, rng)
    }

    fn summary_statistics(&self, raw: O) -> Result<SumStats, AbcError> {
        (self.reduce)(raw)
    }
}
