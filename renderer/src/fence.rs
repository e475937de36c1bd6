//! GPUの進行を表す単調増加のfenceと、その値への到達を待つFenceWait。

use crate::{
    gpu::{Device, RawFence},
    RenderError, Result,
};
use parking_lot::Mutex;
use std::{
    fmt::Debug,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

/// fenceのカウンタの値
pub type FenceValue = u64;

/// ブロックする前にfenceをポーリングする回数
pub const FENCE_SPIN_COUNT: u32 = 64;

/// デバイスのキューに紐づいたfence
///
/// `signal`のたびに値が1ずつ増え、キュー上でそれまでの処理が終わった時点でGPUがその値に到達する。
pub struct Fence<D: Device> {
    raw: Arc<D::Fence>,
    timeline: Arc<Timeline>,
    last_signaled: Mutex<FenceValue>,
    device: Arc<D>,
}
impl<D: Device> Fence<D> {
    /// 値0のfenceを作成する
    pub fn new(device: Arc<D>) -> Result<Self> {
        let raw = Arc::new(device.create_fence()?);
        let timeline = Arc::new(Timeline {
            raw: raw.clone(),
            waiters: Mutex::new(Waiters::default()),
        });
        Ok(Self {
            raw,
            timeline,
            last_signaled: Mutex::new(0),
            device,
        })
    }

    /// 次の値をキューにsignalしてその値のFenceWaitを返す
    pub fn signal(&self) -> Result<FenceWait> {
        // キューに届く値が昇順になるようにロックしたままsignalする
        let mut last_signaled = self.last_signaled.lock();
        let value = *last_signaled + 1;
        self.device.signal(&self.raw, value)?;
        *last_signaled = value;
        Ok(self.wait_for(value))
    }

    /// GPUが到達した値
    pub fn completed_value(&self) -> FenceValue {
        self.raw.completed_value()
    }

    /// 最後にsignalした値
    pub fn last_signaled(&self) -> FenceValue {
        *self.last_signaled.lock()
    }

    /// 指定の値のFenceWaitを作成する
    pub fn wait_for(&self, value: FenceValue) -> FenceWait {
        FenceWait::new(self.timeline.clone(), value)
    }

    /// 最後にsignalした値まで待機する
    pub fn wait_idle(&self) -> Result<()> {
        self.wait_for(self.last_signaled()).wait()
    }

    /// バックエンドのfence
    pub fn raw(&self) -> &D::Fence {
        &self.raw
    }
}

#[derive(Default)]
struct WaiterState {
    result: Option<Result<()>>,
    waker: Option<Waker>,
}

#[derive(Default)]
struct Waiters {
    pending: Vec<(FenceValue, Arc<Mutex<WaiterState>>)>,
    thread_running: bool,
}

/// 一つのfenceと、Futureとして待たれている値の一覧
///
/// 待機スレッドはfenceごとに高々一つで、待つ値が無くなると終了する。
struct Timeline {
    raw: Arc<dyn RawFence>,
    waiters: Mutex<Waiters>,
}
impl Timeline {
    /// 値を待機スレッドに登録し、スレッドが止まっていれば起動する
    fn register(self: &Arc<Self>, value: FenceValue, waker: Waker) -> Result<Arc<Mutex<WaiterState>>> {
        let state = Arc::new(Mutex::new(WaiterState {
            result: None,
            waker: Some(waker),
        }));
        let mut waiters = self.waiters.lock();
        waiters.pending.push((value, state.clone()));
        if !waiters.thread_running {
            let timeline = self.clone();
            let spawned = std::thread::Builder::new()
                .name(String::from("fence-waiter"))
                .spawn(move || timeline.run_waiter());
            if let Err(err) = spawned {
                waiters.pending.pop();
                return Err(RenderError::Backend(err.into()));
            }
            waiters.thread_running = true;
        }
        Ok(state)
    }

    fn run_waiter(&self) {
        loop {
            // 最も小さい値から順に待つ
            let target = {
                let mut waiters = self.waiters.lock();
                match waiters.pending.iter().map(|(value, _)| *value).min() {
                    Some(value) => value,
                    None => {
                        waiters.thread_running = false;
                        return;
                    }
                }
            };
            let result = self.raw.wait(target);

            let finished = {
                let mut waiters = self.waiters.lock();
                match result {
                    Ok(()) => {
                        let reached = self.raw.completed_value().max(target);
                        let (ready, pending): (Vec<_>, Vec<_>) =
                            std::mem::take(&mut waiters.pending)
                                .into_iter()
                                .partition(|(value, _)| *value <= reached);
                        waiters.pending = pending;
                        ready
                            .into_iter()
                            .map(|(_, state)| (state, Ok(())))
                            .collect::<Vec<_>>()
                    }
                    Err(err) => {
                        log::error!("fence wait for {target} failed: {err}");
                        match waiters.pending.iter().position(|(value, _)| *value == target) {
                            Some(index) => vec![(waiters.pending.swap_remove(index).1, Err(err))],
                            None => vec![],
                        }
                    }
                }
            };
            for (state, result) in finished {
                let waker = {
                    let mut state = state.lock();
                    state.result = Some(result);
                    state.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
        }
    }
}

/// fenceが指定の値に到達するのを待つ値型
///
/// `wait`で同期的に待つか、Futureとして`await`する。
/// Futureとしてポーリングされた場合は少しだけスピンした後、
/// fenceごとの待機スレッドに値を登録してそのスレッドからwakeしてもらう。
pub struct FenceWait {
    timeline: Arc<Timeline>,
    value: FenceValue,
    waiter: Option<Arc<Mutex<WaiterState>>>,
}
impl FenceWait {
    fn new(timeline: Arc<Timeline>, value: FenceValue) -> Self {
        Self {
            timeline,
            value,
            waiter: None,
        }
    }

    /// 待機対象の値
    pub fn value(&self) -> FenceValue {
        self.value
    }

    /// GPUがすでに値に到達しているか
    pub fn is_complete(&self) -> bool {
        self.timeline.raw.completed_value() >= self.value
    }

    /// 値に到達するまでブロックする
    pub fn wait(&self) -> Result<()> {
        if self.spin() {
            return Ok(());
        }
        self.timeline.raw.wait(self.value)
    }

    /// 同じfenceの二つのFenceWaitのうち大きい方の値を待つFenceWaitを作る
    pub fn combine(&self, other: &FenceWait) -> FenceWait {
        assert!(
            Arc::ptr_eq(&self.timeline, &other.timeline),
            "cannot combine waits on different fences"
        );
        FenceWait::new(self.timeline.clone(), self.value.max(other.value))
    }

    fn spin(&self) -> bool {
        for _ in 0..FENCE_SPIN_COUNT {
            if self.is_complete() {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }
}

// 待機スレッドへの登録は複製しない
impl Clone for FenceWait {
    fn clone(&self) -> Self {
        Self::new(self.timeline.clone(), self.value)
    }
}

impl Debug for FenceWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceWait")
            .field("value", &self.value)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Future for FenceWait {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(waiter) = &this.waiter {
            let mut state = waiter.lock();
            return match state.result.take() {
                Some(result) => Poll::Ready(result),
                None => {
                    state.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            };
        }

        if this.spin() {
            return Poll::Ready(Ok(()));
        }

        match this.timeline.register(this.value, cx.waker().clone()) {
            Ok(waiter) => {
                this.waiter = Some(waiter);
                Poll::Pending
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    #[test]
    fn signal_values_increase_by_one() {
        let device = Arc::new(HeadlessDevice::new());
        let fence = Fence::new(device).unwrap();
        let first = fence.signal().unwrap();
        let second = fence.signal().unwrap();
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 2);
        assert_eq!(fence.last_signaled(), 2);
        assert!(second.is_complete());
    }

    #[test]
    fn wait_does_not_resolve_before_the_counter_reaches_the_value() {
        let device = Arc::new(HeadlessDevice::deferred());
        let fence = Fence::new(device.clone()).unwrap();
        let wait = fence.signal().unwrap();
        assert!(!wait.is_complete());
        assert_eq!(fence.completed_value(), 0);

        let thread_wait = wait.clone();
        let handle = std::thread::spawn(move || thread_wait.wait());
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());

        device.retire_all();
        handle.join().unwrap().unwrap();
        assert!(wait.is_complete());
    }

    #[test]
    fn future_resolves_after_retire() {
        let device = Arc::new(HeadlessDevice::deferred());
        let fence = Fence::new(device.clone()).unwrap();
        let wait = fence.signal().unwrap();

        let retire = {
            let device = device.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                device.retire_all();
            })
        };
        pollster::block_on(wait.clone()).unwrap();
        assert!(wait.is_complete());
        retire.join().unwrap();
    }

    struct NoopWake;
    impl std::task::Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    #[test]
    fn pending_futures_share_one_waiter_thread() {
        let device = Arc::new(HeadlessDevice::deferred());
        let fence = Fence::new(device.clone()).unwrap();
        let mut waits = (0..3).map(|_| fence.signal().unwrap()).collect::<Vec<_>>();

        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);
        for wait in &mut waits {
            assert!(Pin::new(wait).poll(&mut cx).is_pending());
        }
        {
            let waiters = fence.timeline.waiters.lock();
            assert!(waiters.thread_running);
            assert_eq!(waiters.pending.len(), 3);
        }

        device.retire_all();
        for wait in &mut waits {
            pollster::block_on(wait).unwrap();
        }

        // 待つ値が無くなるとスレッドは終了する
        let stopped = (0..200).any(|_| {
            let stopped = !fence.timeline.waiters.lock().thread_running;
            if !stopped {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            stopped
        });
        assert!(stopped);
        assert!(fence.timeline.waiters.lock().pending.is_empty());
    }

    #[test]
    fn combine_takes_the_later_value() {
        let device = Arc::new(HeadlessDevice::new());
        let fence = Fence::new(device).unwrap();
        let first = fence.signal().unwrap();
        let second = fence.signal().unwrap();
        assert_eq!(first.combine(&second).value(), 2);
        assert_eq!(second.combine(&first).value(), 2);
    }

    #[test]
    #[should_panic(expected = "different fences")]
    fn combine_rejects_waits_of_different_fences() {
        let device = Arc::new(HeadlessDevice::new());
        let a = Fence::new(device.clone()).unwrap().signal().unwrap();
        let b = Fence::new(device).unwrap().signal().unwrap();
        let _ = a.combine(&b);
    }
}
