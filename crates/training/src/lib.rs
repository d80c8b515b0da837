pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod observer;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use classifier::{build_model, ImageClassifier};
pub use config::{TrainingConfig, TrainingError};
pub use data::{BlockingDataLoader, CifarDataSource, DataBatch, DataLoader, DataSource, InMemoryDataSource};
pub use logging::{init_logging, Logger, LoggingSettings};
pub use loss::{CrossEntropyLoss, LossFunction};
pub use metrics::{AverageMeter, EpochSummary, EvaluationSummary};
pub use observer::{EvaluationTrigger, ObserverSet, SessionSummary, TrainingObserver};
pub use optimizer::{GradientScaler, OptimizerConfig, OptimizerState, TrainerOptimizer};
pub use scheduler::{LRScheduler, LambdaScheduler};
pub use trainer::{run_evaluation, select_device, set_seed, StepOutcome, Trainer, TrainingState};
