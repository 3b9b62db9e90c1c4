pub(crate) struct MTBHeap<V, K>
{
    array: Vec<(V, K)>
}

impl<V, K> MTBHeap<V, K>
where K: Ord
{
    pub(crate) fn new() -> MTBHeap<V, K>
    {
        MTBHeap {
            array: Vec::new()
        }
    }

    pub(crate) fn len(&self) -> usize
    {
        self.array.len()
    }

    pub(crate) fn is_empty(&self) -> bool
    {
        self.array.is_empty()
    }

    fn up_bheap(&mut self, pos: usize)
    {
        let mut pos = pos;

        while pos > 0 {
            let parent = (pos - 1) / 2;

            if self.array[pos].1 >= self.array[parent].1 {
                break;
            }

            self.array.swap(pos, parent);
            pos = parent;
        }
    }

    fn down_bheap(&mut self, pos: usize)
    {
        let n_bheap = self.array.len();
        let mut pos = pos;

        while pos < n_bheap / 2 {
            let child0 = (pos * 2) + 1;
            let child1 = (pos * 2) + 2;

            let child = if child1 < n_bheap && self.array[child1].1 < self.array[child0].1 {
                child1
            }
            else {
                child0
            };

            if self.array[pos].1 <= self.array[child].1 {
                break;
            }

            self.array.swap(pos, child);
            pos = child;
        }
    }

    fn remove_at(&mut self, pos: usize) -> Option<(V, K)>
    {
        if pos >= self.array.len() {
            return None;
        }

        // replace pos <=> tail, then remove tail
        let tail = self.array.len() - 1;
        self.array.swap(pos, tail);
        let removed = self.array.pop();

        if pos < self.array.len() {
            self.down_bheap(pos);
            self.up_bheap(pos);
        }

        removed
    }

    pub(crate) fn push(&mut self, v: V, key: K)
    {
        self.array.push((v, key));

        let tail = self.array.len() - 1;
        self.up_bheap(tail);
    }

    pub(crate) fn bheap_h(&self) -> Option<(&V, &K)>
    {
        self.array.first().map(|(v, k)| (v, k))
    }

    pub(crate) fn pop_bheap_h(&mut self) -> Option<(V, K)>
    {
        self.remove_at(0)
    }

    pub(crate) fn remove_by<F>(&mut self, matched: F) -> Option<(V, K)>
    where F: Fn(&V) -> bool
    {
        let pos = self.array.iter().position(|(v, _)| matched(v))?;

        self.remove_at(pos)
    }
}
