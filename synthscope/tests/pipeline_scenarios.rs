use synthscope::core_modules::training_data::{RowOrigin, TrainingSnapshot};
use synthscope::core_modules::utils::image_helper;
use synthscope::{Config, ForensicPipeline, Label};
use tempfile::TempDir;

fn pipeline(dir: &TempDir) -> ForensicPipeline {
    let mut config = Config::with_data_dir(dir.path());
    config.training.placeholder_samples = 20;
    config.training.epochs = 50;
    ForensicPipeline::from_config(config).unwrap()
}

#[tokio::test]
async fn uniform_gray_image_gets_a_bounded_verdict() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir);

    let report = pipeline.analyze(&image_helper::solid_png(64, 48, 128)).await.unwrap();

    assert_eq!(report.feature_vector.len(), pipeline.feature_names().len());
    assert_eq!(report.per_detector_scores.len(), pipeline.feature_names().len());
    assert!(matches!(report.label, Label::Real | Label::Synthetic));
    assert!((0.0..=1.0).contains(&report.confidence));
    assert!(report.feature_vector.as_slice().iter().all(|v| v.is_finite()));
}

#[tokio::test]
async fn corrected_sample_reaches_the_next_model() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir);
    let image = image_helper::gradient_png(96, 64);

    let before = pipeline.analyze(&image).await.unwrap();
    pipeline.submit_feedback(&image, Label::Real).await.unwrap();

    let report = pipeline.retrain().await.unwrap();
    assert_eq!(report.feedback_samples, 1);
    let receipt = pipeline.reload_model().await.unwrap();
    assert_eq!(receipt.trained_at, report.model.trained_at);

    let snapshot = TrainingSnapshot::load(&pipeline.config().snapshot_path())
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.trained_at, receipt.trained_at);
    let found = snapshot
        .set
        .features
        .iter()
        .zip(&snapshot.set.labels)
        .zip(&snapshot.set.origins)
        .any(|((features, label), origin)| {
            matches!(origin, RowOrigin::Feedback { .. })
                && *label == Label::Real
                && features.len() == before.feature_vector.len()
                && features
                    .iter()
                    .zip(before.feature_vector.as_slice())
                    .all(|(a, b)| (a - b).abs() < 1e-9)
        });
    assert!(found, "feedback vector missing from the training snapshot");
}

#[tokio::test]
async fn undecodable_bytes_still_produce_a_report() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir);

    let report = pipeline.analyze(b"this is not an image").await.unwrap();

    assert_eq!(report.failures.len(), pipeline.feature_names().len());
    assert!(report.feature_vector.as_slice().iter().all(|v| *v == 0.0));
    assert!((0.0..=1.0).contains(&report.confidence));
}
