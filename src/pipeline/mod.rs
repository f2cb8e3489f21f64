pub mod batch_analysis;
