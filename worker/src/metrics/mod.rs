mod reporter;
mod summary;

pub use reporter::{MetricsReporter, Report};
pub use summary::{SummaryRecord, SummaryValues, SummaryWriter};
