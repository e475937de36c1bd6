//! 参照カウンタで管理して、参照がすべて破棄された際に
//! オブジェクトの破棄の処理まで行う汎用のHandleを定義する。
//!
//! 参照カウントの実装は標準ライブラリのArcと同じOrderingを用いている。

use std::{
    fmt::Debug,
    ops::Deref,
    ptr::NonNull,
    sync::atomic::{fence, AtomicUsize, Ordering},
};

/// 参照がすべて破棄された際の破棄処理を持つオブジェクト
pub trait Destroy {
    /// Vulkanのオブジェクトを破棄する。
    ///
    /// # Safety
    /// 最後の参照が破棄された時に一度だけ呼ばれる。
    /// GPUがこのオブジェクトを使い終わっていることは呼び出し側が保証する。
    unsafe fn destroy(&mut self);
}

struct HandleData<T> {
    value: T,
    ref_count: AtomicUsize,
}

/// Destroyを実装したオブジェクトを参照カウントで管理するためのハンドル
pub struct Handle<T: Destroy> {
    ptr: NonNull<HandleData<T>>,
}
impl<T: Destroy> Handle<T> {
    /// オブジェクトを参照カウント1のハンドルで包む
    pub fn new(value: T) -> Self {
        let data = Box::new(HandleData {
            value,
            ref_count: AtomicUsize::new(1),
        });
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(data)) };
        Self { ptr }
    }

    /// 現在の参照カウントを取得する
    pub fn ref_count(this: &Self) -> usize {
        this.data().ref_count.load(Ordering::Relaxed)
    }

    /// 二つのハンドルが同じオブジェクトを指しているかを判定する
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    fn data(&self) -> &HandleData<T> {
        unsafe { self.ptr.as_ref() }
    }
}

// 参照カウントを増やすClone
impl<T: Destroy> Clone for Handle<T> {
    fn clone(&self) -> Self {
        if self.data().ref_count.fetch_add(1, Ordering::Relaxed) > usize::MAX / 2 {
            std::process::abort();
        }
        Self { ptr: self.ptr }
    }
}

// 最後の参照が破棄された際にdestroyを呼ぶDrop
impl<T: Destroy> Drop for Handle<T> {
    fn drop(&mut self) {
        if self.data().ref_count.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            unsafe {
                let mut data = Box::from_raw(self.ptr.as_ptr());
                data.value.destroy();
            }
        }
    }
}

// HandleはTにDerefする
impl<T: Destroy> Deref for Handle<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.data().value
    }
}

// Debugトレイトの実装
impl<T: Destroy> Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(std::any::type_name::<Self>()).finish()
    }
}

// 中身がSendかつSyncならHandleはSend
unsafe impl<T: Destroy + Send + Sync> Send for Handle<T> {}
// 中身がSendかつSyncならHandleはSync
unsafe impl<T: Destroy + Send + Sync> Sync for Handle<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Counter(Arc<AtomicUsize>);
    impl Destroy for Counter {
        unsafe fn destroy(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn destroys_once_after_last_clone_is_dropped() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let handle = Handle::new(Counter(destroyed.clone()));
        let cloned = handle.clone();
        assert_eq!(Handle::ref_count(&handle), 2);
        assert!(Handle::ptr_eq(&handle, &cloned));

        drop(handle);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        drop(cloned);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_shared_across_threads() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let handle = Handle::new(Counter(destroyed.clone()));
        let threads = (0..4)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || drop(handle))
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        drop(handle);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
