/// A protocol state machine driven by parsed inputs.
///
/// `check` decides whether an input is acceptable in the current state
/// without changing anything, so the caller can answer a refused input and
/// keep its state. `transition` is only called for accepted inputs.
pub trait FiniteStateMachine: Sized {
    type Input;
    type Context;
    type Error;

    fn check(&self, input: &Self::Input, context: &Self::Context) -> Result<(), Self::Error>;

    #[must_use]
    fn transition(self, input: &Self::Input, context: &mut Self::Context) -> Self;
}
