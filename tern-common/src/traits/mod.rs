pub mod collaborators;
pub mod fsm;
pub mod protocol;

pub use self::{
    collaborators::{
        AliasExpander, DeliveryHandoff, Disposition, DispositionSink, QueueRunner, QueueStore,
    },
    fsm::FiniteStateMachine,
    protocol::Protocol,
};
