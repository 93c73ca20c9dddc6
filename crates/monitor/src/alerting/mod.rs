mod state;

pub use state::{
    AlertStateStore, Clock, NotificationEvent, Observation, Subject, SystemClock, Transition,
};
