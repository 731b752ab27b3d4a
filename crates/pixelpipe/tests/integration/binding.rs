use std::sync::{Arc, Mutex};

use pixelpipe::{Display, DisplayTarget, LoadedFrom, PixelBuffer, TrimLevel};
use pixelpipe_test::ImageServer;

use crate::utils::{eventually, setup_loader};

#[derive(Debug, Default)]
struct View {
    shown: Mutex<Option<(Arc<PixelBuffer>, LoadedFrom)>>,
}

impl Display for View {
    fn clear_display(&self) {
        *self.shown.lock().unwrap() = None;
    }

    fn show_buffer(&self, buffer: &Arc<PixelBuffer>, source: LoadedFrom) {
        *self.shown.lock().unwrap() = Some((buffer.clone(), source));
    }
}

impl View {
    fn shown_uri(&self) -> Option<String> {
        let shown = self.shown.lock().unwrap();
        shown
            .as_ref()
            .and_then(|(buffer, _)| buffer.bound_uri())
            .map(|uri| uri.to_string())
    }
}

#[tokio::test]
async fn test_rebinding_a_view() {
    let server = ImageServer::new();
    let (loader, _cache_dir) = setup_loader(|_| ());
    let cat = server.url("png/100/100/cat.png");
    let dog = server.url("png/100/100/dog.png");

    let target = DisplayTarget::new(View::default(), "thumb");
    let view = target.display();

    target.bind(&loader, &cat, None);
    eventually(|| view.shown_uri().as_deref() == Some(cat.as_str())).await;
    let first = target.shown().unwrap();
    assert_eq!(first.use_count(), 1);

    target.bind(&loader, &dog, None);
    assert_eq!(first.use_count(), 0);
    assert!(view.shown_uri().is_none());
    eventually(|| view.shown_uri().as_deref() == Some(dog.as_str())).await;

    // the released buffer was recycled for the next image
    let second = target.shown().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.use_count(), 1);
    assert_eq!(loader.stats().memory_reuse, 1);

    loader.on_trim_memory(TrimLevel::Complete);
    assert!(!second.is_closed());
    assert_eq!(loader.pool().len(), 1);

    drop(target);
    assert_eq!(second.use_count(), 0);
    loader.clear_memory();
    assert!(second.is_closed());
    assert!(loader.pool().is_empty());
}

#[tokio::test]
async fn test_binding_again_shows_the_pooled_buffer() {
    let server = ImageServer::new();
    let (loader, _cache_dir) = setup_loader(|_| ());
    let cat = server.url("png/100/100/cat.png");

    let first = DisplayTarget::new(View::default(), "thumb");
    let first_view = first.display();
    first.bind(&loader, &cat, None);
    eventually(|| first_view.shown_uri().is_some()).await;

    let second = DisplayTarget::new(View::default(), "thumb");
    let second_view = second.display();
    second.bind(&loader, &cat, None);

    let (buffer, source) = second_view.shown.lock().unwrap().clone().unwrap();
    assert_eq!(source, LoadedFrom::Memory);
    assert!(Arc::ptr_eq(&buffer, &first.shown().unwrap()));
    assert_eq!(buffer.use_count(), 2);

    first.unbind();
    assert!(first_view.shown_uri().is_none());
    assert_eq!(buffer.use_count(), 1);
    assert_eq!(server.hits("png/100/100/cat.png"), 1);
}
